use log::{info, warn};
use std::env;

use crate::services::{RegistryClient, RepositoryInfo};

pub const ENABLE_SMART_BUILDS_ENV_VAR: &str = "OKTETO_SMART_BUILDS_ENABLED";
pub const USE_BUILD_CONTEXT_ENV_VAR: &str = "OKTETO_SMART_BUILDS_USE_BUILD_CONTEXT";
pub const CHECK_CONCURRENCY_ENV_VAR: &str = "OKTETO_BUILD_CHECK_CONCURRENCY";

const DEFAULT_CHECK_CONCURRENCY: usize = 4;

/// Feature flags for smart builds. Resolved once per run so a flag that
/// changes mid-run cannot produce mixed behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmartBuildConfig {
    pub enabled: bool,
    /// Hash the service build context instead of the whole project commit.
    pub use_build_context: bool,
    pub check_concurrency: usize,
}

impl Default for SmartBuildConfig {
    fn default() -> Self {
        SmartBuildConfig {
            enabled: true,
            use_build_context: false,
            check_concurrency: DEFAULT_CHECK_CONCURRENCY,
        }
    }
}

impl SmartBuildConfig {
    pub fn from_env() -> SmartBuildConfig {
        SmartBuildConfig::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> SmartBuildConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SmartBuildConfig::default();

        let check_concurrency = match lookup(CHECK_CONCURRENCY_ENV_VAR) {
            Some(value) if !value.trim().is_empty() => match value.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    warn!(
                        "invalid value {:?} for {}, using {}",
                        value, CHECK_CONCURRENCY_ENV_VAR, defaults.check_concurrency
                    );
                    defaults.check_concurrency
                }
            },
            _ => defaults.check_concurrency,
        };

        SmartBuildConfig {
            enabled: load_bool(&lookup, ENABLE_SMART_BUILDS_ENV_VAR, defaults.enabled),
            use_build_context: load_bool(
                &lookup,
                USE_BUILD_CONTEXT_ENV_VAR,
                defaults.use_build_context,
            ),
            check_concurrency,
        }
    }
}

fn load_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(key) {
        Some(value) => value,
        None => return default,
    };

    match value.trim().to_lowercase().as_str() {
        "" => default,
        "1" | "t" | "true" | "yes" | "on" => true,
        "0" | "f" | "false" | "no" | "off" => false,
        _ => {
            warn!("invalid value {:?} for {}, using {}", value, key, default);
            default
        }
    }
}

/// The cluster the build targets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterContext {
    /// The cluster is managed by Okteto and exposes the dev/global registries.
    pub is_okteto: bool,
    pub namespace: String,
}

/// Per-run facts the tagger and checker depend on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuilderConfig {
    pub is_okteto: bool,
    pub namespace: String,
    pub has_global_access: bool,
    pub is_clean_project: bool,
    pub repository_url: String,
    pub smart_build: SmartBuildConfig,
}

impl BuilderConfig {
    pub async fn resolve(
        cluster: &ClusterContext,
        smart_build: &SmartBuildConfig,
        registry: &dyn RegistryClient,
        repository: &dyn RepositoryInfo,
    ) -> BuilderConfig {
        let has_global_access = if cluster.is_okteto {
            match registry.has_global_push_access().await {
                Ok(has_access) => has_access,
                Err(err) => {
                    info!("error checking global push access: {}", err);
                    false
                }
            }
        } else {
            false
        };

        let is_clean_project = match repository.is_clean() {
            Ok(is_clean) => is_clean,
            Err(err) => {
                info!("error checking if the repository is clean: {}", err);
                false
            }
        };

        BuilderConfig {
            is_okteto: cluster.is_okteto,
            namespace: cluster.namespace.clone(),
            has_global_access,
            is_clean_project,
            repository_url: repository.anonymized_repo(),
            smart_build: smart_build.clone(),
        }
    }
}
