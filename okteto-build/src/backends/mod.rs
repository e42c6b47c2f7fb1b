use anyhow::{anyhow, Context, Result};
use log::debug;
use std::{process::Output, time::Duration};
use tokio::process::Command;

mod docker;
mod git;
mod registry;

pub use docker::DockerBuildRunner;
pub use git::GitRepository;
pub use registry::{DockerRegistry, RegistryNames};

/// Runs `program` with `args` and returns its output, failing if it does not
/// finish within `timeout`.
async fn command_output(program: &str, args: &[String], timeout: Duration) -> Result<Output> {
    debug!("running {} {}", program, args.join(" "));

    let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
        .await
        .map_err(|_| anyhow!("{} did not finish after {:?}", program, timeout))?
        .with_context(|| format!("could not run {}", program))?;

    Ok(output)
}
