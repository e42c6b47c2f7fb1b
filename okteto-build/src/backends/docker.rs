use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use log::{debug, info};
use number_prefix::NumberPrefix;
use std::{env, path::Path, time::Duration};
use tokio::process::Command;

use crate::{models::BuildOptions, services::BuildRunner};

use super::RegistryNames;

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Builds and pushes images with `docker buildx build`.
pub struct DockerBuildRunner {
    names: RegistryNames,
    no_cache: bool,
    timeout: Duration,
}

impl DockerBuildRunner {
    pub fn new(names: RegistryNames, no_cache: bool) -> DockerBuildRunner {
        DockerBuildRunner {
            names,
            no_cache,
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> DockerBuildRunner {
        self.timeout = timeout;
        self
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut command = Command::new(program);
        // Dropping the build future (cancellation, timeout) stops the build.
        command.args(args).kill_on_drop(true);
        command
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<()> {
        let status = tokio::time::timeout(self.timeout, self.command(program, args).status())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", program, self.timeout))?
            .with_context(|| format!("could not run {}", program))?;

        if !status.success() {
            return Err(anyhow!("{} build failed with {}", program, status));
        }

        Ok(())
    }

    fn build_args(&self, options: &BuildOptions) -> Vec<String> {
        let mut args = vec!["buildx".to_string(), "build".to_string(), "--push".to_string()];

        for tag in &options.tags {
            args.push("--tag".into());
            args.push(self.names.expand(tag));
        }

        if let Some(dockerfile) = &options.dockerfile {
            args.push("--file".into());
            args.push(dockerfile.display().to_string());
        }

        if let Some(target) = &options.target {
            args.push("--target".into());
            args.push(target.clone());
        }

        for arg in &options.build_args {
            args.push("--build-arg".into());
            args.push(format!("{}={}", arg.name, arg.value));
        }

        for (id, source) in &options.secrets {
            args.push("--secret".into());
            args.push(format!("id={},src={}", id, expand_home(source)));
        }

        for cache_from in &options.cache_from {
            args.push("--cache-from".into());
            args.push(self.names.expand(cache_from));
        }

        if self.no_cache {
            args.push("--no-cache".into());
        }

        args.push(options.context.display().to_string());
        args
    }
}

#[async_trait]
impl BuildRunner for DockerBuildRunner {
    async fn run(&self, options: &BuildOptions) -> Result<()> {
        let context_size = context_size(&options.context)?;
        match NumberPrefix::binary(context_size as f32) {
            NumberPrefix::Standalone(bytes) => info!("Sending build context ({} bytes)", bytes),
            NumberPrefix::Prefixed(prefix, n) => {
                info!("Sending build context ({:.1} {}B)", n, prefix)
            }
        };

        let args = self.build_args(options);
        debug!("running docker {}", args.join(" "));

        self.run_command("docker", &args).await
    }
}

/// Bytes sent to the builder, honoring `.dockerignore`.
fn context_size(context: &Path) -> Result<u64> {
    let walk = WalkBuilder::new(context)
        .add_custom_ignore_filename(".dockerignore")
        .ignore(false)
        .git_global(false)
        .git_ignore(false)
        .git_exclude(false)
        .hidden(false)
        .build();

    let mut size = 0;
    for result in walk {
        let entry = result?;
        if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            size += entry.metadata()?.len();
        }
    }

    Ok(size)
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    }
}
