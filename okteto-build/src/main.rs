use anyhow::{anyhow, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, warn};
use std::{
    collections::BTreeMap as Map,
    env,
    io::{stdout, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use structopt::StructOpt;

use backends::{DockerBuildRunner, DockerRegistry, GitRepository, RegistryNames};
use config::{BuilderConfig, ClusterContext, SmartBuildConfig};
use controller::{BuildRequest, CacheStatus, Controller, PlannedService};
use error::{BuildError, ValidationError};
use models::BuildPolicy;

mod backends;
mod checker;
mod config;
mod controller;
mod environment;
mod error;
mod frontends;
mod graph;
mod hasher;
mod metadata;
mod models;
mod services;
mod tagger;

const MANIFEST_FILE_NAMES: &[&str] = &[
    "okteto.yml",
    "okteto.yaml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

#[derive(Debug, StructOpt)]
#[structopt(
    name = "okteto-build",
    about = "Builds the images of an Okteto manifest, reusing the ones that are already built."
)]
struct Opt {
    #[structopt(short, long, parse(from_os_str))]
    /// Manifest to use instead of searching the current directory and its parents.
    file: Option<PathBuf>,

    #[structopt(long, env = "OKTETO_NAMESPACE", default_value = "")]
    namespace: String,

    #[structopt(long, env = "OKTETO_REGISTRY_URL", default_value = "")]
    /// Registry the okteto.dev and okteto.global aliases point to.
    registry_url: String,

    #[structopt(long)]
    /// The cluster is managed by Okteto.
    managed: bool,

    #[structopt(long)]
    /// Allow pushing to the global registry.
    global_access: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Builds the requested services and the services they depend on.
    Build {
        #[structopt(long)]
        /// Build even if an image built from the same sources exists.
        no_cache: bool,

        #[structopt(short, long)]
        tag: Option<String>,

        #[structopt(long)]
        target: Option<String>,

        #[structopt(long)]
        cache_from: Vec<String>,

        #[structopt(long, parse(try_from_str = parse_key_value))]
        /// Secret to expose to the build, as id=path.
        secret: Vec<(String, String)>,

        #[structopt(long, parse(from_os_str))]
        /// Write the published OKTETO_BUILD_* variables to this file.
        env_file: Option<PathBuf>,

        #[structopt(long, parse(from_os_str))]
        /// Write per service build metadata as JSON to this file.
        metadata_file: Option<PathBuf>,

        services: Vec<String>,
    },
    /// Shows which services would be built and which would be reused.
    Plan {
        #[structopt(long)]
        /// Reuse any existing image of a service, whatever it was built from.
        only_missing: bool,

        services: Vec<String>,
    },
    /// Prints the build hash of a service.
    Hash { service: String },
}

fn parse_key_value(value: &str) -> Result<(String, String)> {
    let split_index = value
        .find('=')
        .ok_or_else(|| anyhow!("expected id=value, got {:?}", value))?;
    let (key, value) = value.split_at(split_index);
    Ok((key.to_string(), value[1..].to_string()))
}

fn find_manifest_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for file_name in MANIFEST_FILE_NAMES {
            let manifest_path = path.join(file_name);
            if manifest_path.exists() {
                return Some(manifest_path);
            }
        }
    }

    None
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let mut stdout = stdout();

    let manifest_path = match opt.file {
        Some(file) => file.canonicalize()?,
        None => find_manifest_file(env::current_dir()?).ok_or_else(|| {
            anyhow!(
                "Couldn't find an okteto manifest or a docker-compose file \
                 in the current working directory or any of its parents."
            )
        })?,
    };
    info!("found manifest {:?}", manifest_path);

    let work_directory = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("Manifest file has no parent."))?;
    info!("found work directory {:?}", work_directory);

    env::set_current_dir(work_directory)?;

    let project_name = work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .ok_or_else(|| anyhow!("Couldn't determine the project name."))?;
    info!("project name {:?}", project_name);

    let mut frontend = frontends::frontend_for(&manifest_path);
    let mut manifest = frontend.manifest(project_name, manifest_path.as_path())?;
    info!("parsed manifest {:?}", manifest.name);

    let names = RegistryNames::new(opt.registry_url.clone(), opt.namespace.clone());
    let registry = Arc::new(DockerRegistry::new(names.clone(), opt.global_access));
    let repository = Arc::new(GitRepository::new(work_directory));

    let cluster = ClusterContext {
        is_okteto: opt.managed,
        namespace: opt.namespace.clone(),
    };
    let smart_build = SmartBuildConfig::from_env();
    let config =
        BuilderConfig::resolve(&cluster, &smart_build, registry.as_ref(), repository.as_ref())
            .await;
    info!("resolved builder config {:?}", config);

    let no_cache = matches!(opt.command, Command::Build { no_cache: true, .. });
    let runner = Arc::new(DockerBuildRunner::new(names, no_cache));

    let mut controller = Controller::init(config, runner, registry, repository, work_directory);
    info!("created controller");

    match opt.command {
        Command::Build {
            no_cache,
            tag,
            target,
            cache_from,
            secret,
            env_file,
            metadata_file,
            services,
        } => {
            if let Some(metadata_file) = metadata_file {
                controller.add_completion_hook(Box::new(move |metadata| {
                    if let Err(err) = metadata::write_report(&metadata_file, metadata) {
                        warn!("{:#}", err);
                    }
                }));
            }

            let request = BuildRequest {
                services,
                policy: if no_cache {
                    BuildPolicy::Always
                } else {
                    BuildPolicy::IfChanged
                },
                tag,
                target,
                cache_from,
                secrets: secret.into_iter().collect::<Map<_, _>>(),
            };

            let shutdown = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            };

            let outcome = match controller
                .build_until(&mut manifest, &request, shutdown)
                .await
            {
                Err(BuildError::Validation(ValidationError::NoServicesToBuild)) => {
                    print_info(&mut stdout, "no services to build defined.\n")?;
                    return Ok(());
                }
                result => result?,
            };

            print_images(&mut stdout, &outcome.images)?;

            if let Some(env_file) = env_file {
                outcome.environment.write_env_file(&env_file)?;
            }
        }
        Command::Plan {
            only_missing,
            services,
        } => {
            let request = BuildRequest {
                services,
                policy: if only_missing {
                    BuildPolicy::IfNotPresent
                } else {
                    BuildPolicy::IfChanged
                },
                ..Default::default()
            };

            match controller.plan(&manifest, &request).await {
                Err(BuildError::Validation(ValidationError::NoServicesToBuild)) => {
                    print_info(&mut stdout, "no services to build defined.\n")?;
                }
                result => print_plan(&mut stdout, &result?)?,
            }
        }
        Command::Hash { service } => {
            let hash = controller.service_hash(&manifest, &service)?;
            stdout.queue(style::Print(format!("{}\n", hash)))?.flush()?;
        }
    }

    Ok(())
}

fn print_info(stdout: &mut impl Write, message: &str) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
        .queue(style::Print(message))?
        .flush()?;

    Ok(())
}

fn print_images(
    stdout: &mut impl Write,
    images: &indexmap::IndexMap<String, String>,
) -> Result<()> {
    let longest_service = images.keys().map(|service| service.len()).max().unwrap_or(0);

    for (service, image) in images.iter() {
        let padding = longest_service - service.len() + 1;
        stdout
            .queue(style::Print(service))?
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::PrintStyledContent(style::style(image.clone()).green()))?
            .queue(style::Print("\n"))?;
    }

    stdout.flush()?;
    Ok(())
}

fn print_plan(stdout: &mut impl Write, planned: &[PlannedService]) -> Result<()> {
    let longest_service = planned
        .iter()
        .map(|planned| planned.service.len())
        .max()
        .unwrap_or(0);

    for planned in planned.iter() {
        let padding = longest_service - planned.service.len() + 1;
        stdout
            .queue(style::Print(&planned.service))?
            .queue(cursor::MoveRight(padding as u16))?;

        match &planned.status {
            CacheStatus::Hit(reference) => stdout
                .queue(style::PrintStyledContent("reuse ".green().bold()))?
                .queue(style::Print(reference))?,
            CacheStatus::Miss => stdout
                .queue(style::PrintStyledContent("build ".yellow().bold()))?
                .queue(style::Print(&planned.hash))?,
            CacheStatus::NotBuildable => {
                stdout.queue(style::PrintStyledContent("skip".dark_grey()))?
            }
        };

        stdout.queue(style::Print("\n"))?;
    }

    stdout.flush()?;
    Ok(())
}
