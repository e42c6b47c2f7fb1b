use anyhow::{Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt::Write,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{models::BuildInfo, services::RepositoryInfo};

/// Commit identity a build hash is derived from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct BuildContextIdentity {
    commit: String,
    diff: String,
}

/// Derives deterministic content hashes for service build definitions.
///
/// The hash is the cache key smart builds use to find a previously built
/// image, so the same inputs must always produce the same string.
///
/// Clones share their commit caches.
#[derive(Clone)]
pub struct ServiceHasher {
    repository: Arc<dyn RepositoryInfo>,
    working_dir: PathBuf,
    use_build_context: bool,
    project_commit: Arc<Mutex<Option<String>>>,
    context_cache: Arc<Mutex<HashMap<PathBuf, BuildContextIdentity>>>,
}

impl ServiceHasher {
    pub fn new(
        repository: Arc<dyn RepositoryInfo>,
        working_dir: PathBuf,
        use_build_context: bool,
    ) -> ServiceHasher {
        ServiceHasher {
            repository,
            working_dir,
            use_build_context,
            project_commit: Arc::new(Mutex::new(None)),
            context_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The hash used as cache key for `service`. Git failures only weaken
    /// the hash, they never fail it.
    pub fn build_hash(&self, info: &BuildInfo, service: &str) -> String {
        if self.use_build_context {
            return self.hash_with_build_context(info, service);
        }

        match self.hash_project_commit(info) {
            Ok(hash) => hash,
            Err(err) => {
                info!("could not get repository sha for service {:?}: {:#}", service, err);
                canonical_hash(&self.canonical(info, "commit", "", None))
            }
        }
    }

    /// Hash of `info` combined with the commit of the whole project.
    pub fn hash_project_commit(&self, info: &BuildInfo) -> Result<String> {
        let cached = lock(&self.project_commit).clone();
        let commit = match cached {
            Some(commit) => commit,
            None => {
                let commit = self
                    .repository
                    .sha()
                    .context("could not get repository sha")?;
                *lock(&self.project_commit) = Some(commit.clone());
                commit
            }
        };

        Ok(canonical_hash(&self.canonical(info, "commit", &commit, None)))
    }

    /// Hash of `info` combined with the latest commit and the uncommitted
    /// changes of its build context.
    pub fn hash_with_build_context(&self, info: &BuildInfo, service: &str) -> String {
        let context = self.absolute(&info.context);
        let identity = self.build_context_identity(&context, service);
        let dockerfile_digest = self.dockerfile_digest(info);

        canonical_hash(&self.canonical(
            info,
            "build_context_commit",
            &identity.commit,
            Some((&dockerfile_digest, &identity.diff)),
        ))
    }

    fn build_context_identity(&self, context: &Path, service: &str) -> BuildContextIdentity {
        if let Some(identity) = lock(&self.context_cache).get(context) {
            return identity.clone();
        }

        debug!("smart build context directory: {}", context.display());

        let mut git_failed = false;
        let commit = self.repository.latest_dir_sha(context).unwrap_or_else(|err| {
            info!("could not get build context sha: {:#}", err);
            git_failed = true;
            String::new()
        });
        let diff = self.repository.diff_hash(context).unwrap_or_else(|err| {
            info!("could not get build context diff sha: {:#}", err);
            git_failed = true;
            String::new()
        });

        if git_failed {
            warn!(
                "smart builds cannot access git metadata for service {:?}, \
                 cache precision is reduced",
                service
            );
        }

        // Concurrent callers may compute the same identity; the first insert wins.
        lock(&self.context_cache)
            .entry(context.to_path_buf())
            .or_insert(BuildContextIdentity { commit, diff })
            .clone()
    }

    fn canonical(
        &self,
        info: &BuildInfo,
        commit_label: &str,
        commit: &str,
        build_context: Option<(&str, &str)>,
    ) -> String {
        let args = info
            .args
            .iter()
            .map(|arg| format!("{}={}", escape_name(&arg.name), escape(&arg.value)))
            .collect::<Vec<_>>()
            .join(";");

        let secrets = info
            .secrets
            .iter()
            .map(|(key, value)| format!("{}={}", escape_name(key), escape(value)))
            .collect::<Vec<_>>()
            .join(";");

        let dockerfile = info
            .dockerfile
            .as_ref()
            .map(|dockerfile| dockerfile.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut text = String::new();
        // Writing to a String cannot fail.
        let _ = write!(text, "{}:{};", commit_label, escape(commit));
        let _ = write!(text, "target:{};", escape(info.target.as_deref().unwrap_or("")));
        let _ = write!(text, "build_args:{};", args);
        let _ = write!(text, "secrets:{};", secrets);
        let _ = write!(text, "context:{};", escape(&info.context.to_string_lossy()));
        let _ = write!(text, "dockerfile:{};", escape(&dockerfile));
        let _ = write!(text, "image:{};", escape(info.image.as_deref().unwrap_or("")));

        if let Some((dockerfile_digest, diff)) = build_context {
            let _ = write!(text, "dockerfile_content:{};", dockerfile_digest);
            let _ = write!(text, "diff:{};", escape(diff));
        }

        debug!("hashing build info: {}", text);
        text
    }

    fn dockerfile_digest(&self, info: &BuildInfo) -> String {
        let dockerfile = match info.dockerfile.as_ref() {
            Some(dockerfile) => dockerfile,
            None => return String::new(),
        };

        let candidates = [
            self.absolute(dockerfile),
            self.absolute(&info.context.join(dockerfile)),
        ];

        for candidate in candidates.iter() {
            match fs::read(candidate) {
                Ok(content) => return hex::encode(Sha256::digest(&content)),
                Err(err) => debug!(
                    "error trying to read Dockerfile on path {}: {}",
                    candidate.display(),
                    err
                ),
            }
        }

        String::new()
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn canonical_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace(';', "\\;")
}

fn escape_name(value: &str) -> String {
    escape(value).replace('=', "\\=")
}
