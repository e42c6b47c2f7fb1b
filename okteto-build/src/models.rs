use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use std::{collections::BTreeMap as Map, fmt, path::PathBuf};

/// Per-user registry namespace. Always writable.
pub const DEV_REGISTRY: &str = "okteto.dev";
/// Shared, content-addressed registry namespace.
pub const GLOBAL_REGISTRY: &str = "okteto.global";
/// Tag used for inferred references that are not content-addressed.
pub const DEFAULT_IMAGE_TAG: &str = "okteto";
/// Tag marker for images that have local volumes baked in.
pub const VOLUME_MOUNTS_TAG: &str = "okteto-with-volume-mounts";
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

const DOCKER_HUB: &str = "docker.io";
const DEFAULT_REFERENCE_TAG: &str = "latest";

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

impl BuildArg {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> BuildArg {
        BuildArg {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for BuildArg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VolumeMount {
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// Build declaration of a single service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub image: Option<String>,
    pub target: Option<String>,
    pub args: Vec<BuildArg>,
    pub secrets: Map<String, String>,
    pub cache_from: Vec<String>,
    pub volumes_to_include: Vec<VolumeMount>,
    pub depends_on: Vec<String>,
}

impl Default for BuildInfo {
    fn default() -> Self {
        BuildInfo {
            context: PathBuf::from("."),
            dockerfile: None,
            image: None,
            target: None,
            args: Vec::new(),
            secrets: Map::new(),
            cache_from: Vec::new(),
            volumes_to_include: Vec::new(),
            depends_on: Vec::new(),
        }
    }
}

impl BuildInfo {
    pub fn has_dockerfile(&self) -> bool {
        self.dockerfile
            .as_ref()
            .map(|dockerfile| !dockerfile.as_os_str().is_empty())
            .unwrap_or(false)
    }

    pub fn has_volumes(&self) -> bool {
        !self.volumes_to_include.is_empty()
    }

    /// The explicit image, if one is declared and not blank.
    pub fn explicit_image(&self) -> Option<&str> {
        self.image.as_deref().filter(|image| !image.is_empty())
    }

    /// Dockerfile path as the runner sees it: absolute paths are kept, relative
    /// ones are resolved against the context when the file exists there.
    pub fn dockerfile_path(&self) -> Option<PathBuf> {
        let dockerfile = self.dockerfile.as_ref()?;
        if dockerfile.is_absolute() {
            return Some(dockerfile.clone());
        }

        let joined = self.context.join(dockerfile);
        if joined.is_file() {
            Some(joined)
        } else {
            Some(dockerfile.clone())
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManifestKind {
    /// An okteto manifest with build and deploy sections.
    Pipeline,
    /// A compose file.
    Stack,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployCommand {
    pub name: String,
    pub command: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackService {
    pub image: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stack {
    pub services: IndexMap<String, StackService>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deploy {
    pub commands: Vec<DeployCommand>,
    pub stack: Option<Stack>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub kind: ManifestKind,
    pub build: IndexMap<String, BuildInfo>,
    pub deploy: Option<Deploy>,
}

impl Manifest {
    pub fn new<N: Into<String>>(name: N, kind: ManifestKind) -> Manifest {
        Manifest {
            name: name.into(),
            kind,
            build: IndexMap::new(),
            deploy: None,
        }
    }
}

/// How the cache is consulted before building.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    /// Never consult the cache.
    Always,
    /// Reuse an image only when its build hash matches.
    IfChanged,
    /// Reuse any image already present for the service.
    IfNotPresent,
}

/// Everything the build runner needs to produce and push one image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub tags: Vec<String>,
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub target: Option<String>,
    pub build_args: Vec<BuildArg>,
    pub secrets: Map<String, String>,
    pub cache_from: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub image: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<ImageReference> {
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(anyhow!("could not parse reference: {:?}", image));
        }

        let (name, tag) = match image.find('@') {
            Some(index) => (&image[..index], image[index + 1..].to_string()),
            None => {
                let last_slash = image.rfind('/').map(|index| index + 1).unwrap_or(0);
                match image[last_slash..].find(':') {
                    Some(index) => {
                        let index = last_slash + index;
                        (&image[..index], image[index + 1..].to_string())
                    }
                    None => (image, DEFAULT_REFERENCE_TAG.to_string()),
                }
            }
        };

        if name.is_empty() || tag.is_empty() || name.ends_with('/') {
            return Err(anyhow!("could not parse reference: {:?}", image));
        }

        let (registry, repository) = match name.find('/') {
            Some(index) => {
                let first = &name[..index];
                if first.contains('.') || first.contains(':') || first == "localhost" {
                    (first.to_string(), name[index + 1..].to_string())
                } else {
                    (DOCKER_HUB.to_string(), name.to_string())
                }
            }
            None => (DOCKER_HUB.to_string(), format!("library/{}", name)),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            image: image.to_string(),
        })
    }

    pub fn is_digest(&self) -> bool {
        self.tag.starts_with("sha256:")
    }
}

/// Lowercase and restrict to `[a-z0-9-]` so the name can be used as part of
/// a repository path.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = sanitized.trim_matches('-');
    trimmed
        .chars()
        .take(63)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}
