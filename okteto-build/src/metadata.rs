use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::{
    fs,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

/// What happened to a single service during a build run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    pub dev_env_name: String,
    pub namespace: String,
    pub repo_url: String,
    pub build_hash: String,
    pub repo_hash: String,
    pub cache_hit: bool,
    pub success: bool,
    #[serde(serialize_with = "seconds")]
    pub build_duration: Duration,
    #[serde(serialize_with = "seconds")]
    pub hash_duration: Duration,
    #[serde(serialize_with = "seconds")]
    pub cache_hit_duration: Duration,
    #[serde(serialize_with = "seconds")]
    pub clone_duration: Duration,
}

fn seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

pub type CompletionHook = Box<dyn Fn(&IndexMap<String, BuildMetadata>) + Send + Sync>;

/// Collects metadata per service. Entries are kept in the order services are
/// first touched, which is the build order.
pub struct MetadataCollector {
    dev_env_name: String,
    namespace: String,
    repo_url: String,
    entries: Mutex<IndexMap<String, BuildMetadata>>,
}

impl MetadataCollector {
    pub fn new(dev_env_name: &str, namespace: &str, repo_url: &str) -> MetadataCollector {
        MetadataCollector {
            dev_env_name: dev_env_name.to_string(),
            namespace: namespace.to_string(),
            repo_url: repo_url.to_string(),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn update<F>(&self, service: &str, f: F)
    where
        F: FnOnce(&mut BuildMetadata),
    {
        let mut entries = self.lock();
        let entry = entries
            .entry(service.to_string())
            .or_insert_with(|| BuildMetadata {
                dev_env_name: self.dev_env_name.clone(),
                namespace: self.namespace.clone(),
                repo_url: self.repo_url.clone(),
                ..Default::default()
            });
        f(entry);
    }

    pub fn get(&self, service: &str) -> Option<BuildMetadata> {
        self.lock().get(service).cloned()
    }

    pub fn all(&self) -> IndexMap<String, BuildMetadata> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, BuildMetadata>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes the collected metadata as a JSON object keyed by service.
pub fn write_report(path: &Path, metadata: &IndexMap<String, BuildMetadata>) -> Result<()> {
    let report = serde_json::to_string_pretty(metadata)?;
    fs::write(path, report)
        .with_context(|| format!("could not write build metadata to {}", path.display()))
}
