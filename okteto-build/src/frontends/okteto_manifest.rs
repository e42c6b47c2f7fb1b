use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    collections::BTreeMap as Map,
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    models::{BuildArg, BuildInfo, Deploy, DeployCommand, Manifest, ManifestKind},
    services::ManifestFrontend,
};

use super::{DockerComposeFrontend, MapList, StringOrList};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OktetoManifestFile {
    pub name: Option<String>,

    #[serde(default)]
    pub build: IndexMap<String, Build>,

    pub deploy: Option<DeploySection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Build {
    Short(String),
    Extended {
        context: Option<String>,

        dockerfile: Option<String>,

        image: Option<String>,

        target: Option<String>,

        #[serde(default)]
        args: MapList,

        #[serde(default)]
        secrets: Map<String, String>,

        #[serde(default)]
        cache_from: StringOrList,

        #[serde(default)]
        depends_on: StringOrList,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum DeploySection {
    Commands(Vec<Command>),
    Extended {
        #[serde(default)]
        commands: Vec<Command>,

        compose: Option<Compose>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Command {
    Short(String),
    Named { name: Option<String>, command: String },
}

impl Command {
    fn into_deploy_command(self) -> DeployCommand {
        match self {
            Command::Short(command) => DeployCommand {
                name: command.clone(),
                command,
            },
            Command::Named { name, command } => DeployCommand {
                name: name.unwrap_or_else(|| command.clone()),
                command,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Compose {
    Short(String),
    Extended { file: String },
}

impl Build {
    fn into_build_info(self) -> BuildInfo {
        match self {
            Build::Short(context) => BuildInfo {
                context: PathBuf::from(context),
                dockerfile: Some(PathBuf::from("Dockerfile")),
                ..Default::default()
            },
            Build::Extended {
                context,
                dockerfile,
                image,
                target,
                args,
                secrets,
                cache_from,
                depends_on,
            } => {
                let context = PathBuf::from(context.unwrap_or_else(|| ".".into()));

                // Without an image there is nothing to point to, so the
                // default Dockerfile is assumed.
                let dockerfile = match (dockerfile, image.as_ref()) {
                    (Some(dockerfile), _) => Some(PathBuf::from(dockerfile)),
                    (None, None) => Some(PathBuf::from("Dockerfile")),
                    (None, Some(_)) if context.as_os_str() != "." => {
                        Some(PathBuf::from("Dockerfile"))
                    }
                    (None, Some(_)) => None,
                };

                BuildInfo {
                    context,
                    dockerfile,
                    image,
                    target,
                    args: args
                        .into_pairs()
                        .into_iter()
                        .map(|(name, value)| BuildArg::new(name, value))
                        .collect(),
                    secrets,
                    cache_from: cache_from.into_vec(),
                    depends_on: depends_on.into_vec(),
                    ..Default::default()
                }
            }
        }
    }
}

pub struct OktetoManifestFrontend;

impl OktetoManifestFrontend {
    pub fn new() -> OktetoManifestFrontend {
        OktetoManifestFrontend
    }
}

impl ManifestFrontend for OktetoManifestFrontend {
    fn manifest(&mut self, manifest_name: &str, manifest_path: &Path) -> Result<Manifest> {
        let manifest_file = File::open(manifest_path)
            .with_context(|| format!("could not open {}", manifest_path.display()))?;
        let file: OktetoManifestFile = serde_yaml::from_reader(manifest_file)
            .with_context(|| format!("could not parse {}", manifest_path.display()))?;

        let name = file.name.unwrap_or_else(|| manifest_name.to_string());
        let mut manifest = Manifest::new(name, ManifestKind::Pipeline);

        for (service, build) in file.build {
            manifest.build.insert(service, build.into_build_info());
        }

        let (commands, compose) = match file.deploy {
            Some(DeploySection::Commands(commands)) => (commands, None),
            Some(DeploySection::Extended { commands, compose }) => (commands, compose),
            None => (Vec::new(), None),
        };

        let stack = match compose {
            Some(Compose::Short(file)) | Some(Compose::Extended { file }) => {
                let compose_path = manifest_path
                    .parent()
                    .map(|parent| parent.join(&file))
                    .unwrap_or_else(|| PathBuf::from(&file));
                debug!("loading compose file {}", compose_path.display());

                let (stack, build) = DockerComposeFrontend::new().stack(&compose_path)?;
                for (service, info) in build {
                    manifest.build.entry(service).or_insert(info);
                }
                Some(stack)
            }
            None => None,
        };

        if !commands.is_empty() || stack.is_some() {
            manifest.deploy = Some(Deploy {
                commands: commands
                    .into_iter()
                    .map(Command::into_deploy_command)
                    .collect(),
                stack,
            });
        }

        Ok(manifest)
    }
}
