use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    collections::BTreeMap as Map,
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    models::{
        BuildArg, BuildInfo, Deploy, Manifest, ManifestKind, Stack, StackService, VolumeMount,
        DEFAULT_DOCKERFILE,
    },
    services::ManifestFrontend,
};

use super::MapList;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DockerComposeFile {
    pub version: Option<String>,

    #[serde(default)]
    pub services: IndexMap<String, Service>,

    #[serde(default)]
    pub secrets: Map<String, SecretSource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Service {
    pub image: Option<String>,

    pub build: Option<Build>,

    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Build {
    Short(String),
    Extended {
        #[serde(default = "default_context")]
        context: String,

        dockerfile: Option<String>,

        #[serde(default)]
        args: MapList,

        #[serde(default)]
        cache_from: Vec<String>,

        target: Option<String>,

        #[serde(default)]
        secrets: Vec<String>,
    },
}

fn default_context() -> String {
    ".".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Volume {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: Option<String>,
        source: Option<String>,
        target: String,
    },
}

impl Volume {
    /// Host paths are included into the image, named volumes are left to
    /// the deploy.
    fn host_mount(&self) -> Option<VolumeMount> {
        let (source, target) = match self {
            Volume::Short(volume) => {
                let mut parts = volume.splitn(3, ':');
                let source = parts.next()?;
                let target = parts.next()?;
                (source.to_string(), target.to_string())
            }
            Volume::Long {
                kind,
                source,
                target,
            } => {
                if kind.as_deref().map(|kind| kind != "bind").unwrap_or(false) {
                    return None;
                }
                (source.clone()?, target.clone())
            }
        };

        if source.starts_with('.') || source.starts_with('/') {
            Some(VolumeMount {
                local_path: PathBuf::from(source),
                remote_path: target,
            })
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SecretSource {
    pub file: Option<String>,
    pub environment: Option<String>,
}

pub struct DockerComposeFrontend;

impl DockerComposeFrontend {
    pub fn new() -> DockerComposeFrontend {
        DockerComposeFrontend
    }

    /// The compose services as a stack, plus the build entry of every
    /// service that has something to build.
    pub(crate) fn stack(
        &self,
        compose_file_path: &Path,
    ) -> Result<(Stack, IndexMap<String, BuildInfo>)> {
        let compose_file = File::open(compose_file_path)
            .with_context(|| format!("could not open {}", compose_file_path.display()))?;
        let file: DockerComposeFile = serde_yaml::from_reader(compose_file)
            .with_context(|| format!("could not parse {}", compose_file_path.display()))?;

        let mut stack = Stack::default();
        let mut build = IndexMap::new();

        let DockerComposeFile {
            services,
            secrets: declared_secrets,
            ..
        } = file;

        for (service_name, service) in services {
            let mut info = match service.build {
                Some(Build::Short(context)) => BuildInfo {
                    context: PathBuf::from(context),
                    dockerfile: Some(PathBuf::from(DEFAULT_DOCKERFILE)),
                    ..Default::default()
                },
                Some(Build::Extended {
                    context,
                    dockerfile,
                    args,
                    cache_from,
                    target,
                    secrets,
                }) => BuildInfo {
                    context: PathBuf::from(context),
                    dockerfile: Some(PathBuf::from(
                        dockerfile.unwrap_or_else(|| DEFAULT_DOCKERFILE.into()),
                    )),
                    target,
                    args: args
                        .into_pairs()
                        .into_iter()
                        .map(|(name, value)| BuildArg::new(name, value))
                        .collect(),
                    cache_from,
                    secrets: secrets
                        .into_iter()
                        .filter_map(|name| {
                            let source = declared_secrets.get(&name)?;
                            let value = source
                                .file
                                .clone()
                                .or_else(|| source.environment.clone())?;
                            Some((name, value))
                        })
                        .collect(),
                    ..Default::default()
                },
                None => BuildInfo {
                    dockerfile: None,
                    ..Default::default()
                },
            };

            info.image = service.image.clone();
            info.volumes_to_include = service
                .volumes
                .iter()
                .filter_map(Volume::host_mount)
                .collect();

            if info.has_dockerfile() || info.has_volumes() {
                build.insert(service_name.clone(), info);
            }

            stack.services.insert(
                service_name,
                StackService {
                    image: service.image,
                },
            );
        }

        Ok((stack, build))
    }
}

impl ManifestFrontend for DockerComposeFrontend {
    fn manifest(&mut self, manifest_name: &str, manifest_path: &Path) -> Result<Manifest> {
        let (stack, build) = self.stack(manifest_path)?;

        let mut manifest = Manifest::new(manifest_name, ManifestKind::Stack);
        manifest.build = build;
        manifest.deploy = Some(Deploy {
            commands: Vec::new(),
            stack: Some(stack),
        });

        Ok(manifest)
    }
}
