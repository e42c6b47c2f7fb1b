use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::services::RepositoryInfo;

/// Repository facts read through the `git` command line.
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    pub fn new<P: Into<PathBuf>>(root: P) -> GitRepository {
        GitRepository { root: root.into() }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .context("could not run git")?;

        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RepositoryInfo for GitRepository {
    fn sha(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn latest_dir_sha(&self, path: &Path) -> Result<String> {
        let path = path.to_string_lossy();
        let sha = self.git(&["log", "-n", "1", "--format=%H", "--", &path])?;
        let sha = sha.trim();
        if sha.is_empty() {
            return Err(anyhow!("no commit touches {}", path));
        }

        Ok(sha.to_string())
    }

    fn diff_hash(&self, path: &Path) -> Result<String> {
        let path = path.to_string_lossy();
        let diff = self.git(&["diff", "HEAD", "--", &path])?;
        let untracked = self.git(&["ls-files", "--others", "--exclude-standard", "--", &path])?;

        let mut hasher = Sha256::new();
        hasher.update(diff.as_bytes());
        hasher.update(untracked.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn is_clean(&self) -> Result<bool> {
        Ok(self.git(&["status", "--porcelain"])?.trim().is_empty())
    }

    fn anonymized_repo(&self) -> String {
        self.git(&["config", "--get", "remote.origin.url"])
            .map(|url| anonymize_url(url.trim()))
            .unwrap_or_default()
    }
}

/// Drops any credentials from a remote url.
fn anonymize_url(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            let host_start = match (rest.find('@'), rest.find('/')) {
                (Some(at), Some(slash)) if at < slash => at + 1,
                (Some(at), None) => at + 1,
                _ => 0,
            };
            format!("{}{}", &url[..scheme_end + 3], &rest[host_start..])
        }
        None => url.to_string(),
    }
}
