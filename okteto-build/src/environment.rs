use anyhow::{Context, Result};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::{
    collections::BTreeMap,
    env,
    fmt::Write as _,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{models::ImageReference, services::RegistryClient};

pub const REGISTRY_SUFFIX: &str = "REGISTRY";
pub const REPOSITORY_SUFFIX: &str = "REPOSITORY";
pub const IMAGE_SUFFIX: &str = "IMAGE";
pub const TAG_SUFFIX: &str = "TAG";
pub const SHA_SUFFIX: &str = "SHA";

const DIGEST_PREFIX: &str = "sha256:";

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable pattern is valid")
});

/// Variables published by a build run, shared by every task of that run.
#[derive(Clone, Debug, Default)]
pub struct BuildEnvironment {
    vars: Arc<Mutex<BTreeMap<String, String>>>,
}

impl BuildEnvironment {
    pub fn new() -> BuildEnvironment {
        BuildEnvironment::default()
    }

    /// Inserts every pair while holding the lock once, so readers never see a
    /// partial set.
    pub fn set_all<I>(&self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut guard = self.lock();
        for (key, value) in vars {
            guard.insert(key, value);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    /// The variables published for `service`, in suffix order.
    pub fn service_vars(&self, service: &str) -> Vec<(String, String)> {
        let guard = self.lock();
        [REGISTRY_SUFFIX, REPOSITORY_SUFFIX, IMAGE_SUFFIX, TAG_SUFFIX, SHA_SUFFIX]
            .iter()
            .filter_map(|suffix| {
                let key = service_env_var(service, suffix);
                guard.get(&key).map(|value| (key, value.clone()))
            })
            .collect()
    }

    /// Substitutes `$VAR` and `${VAR}` with values from this environment,
    /// falling back to the process environment. Unknown variables are kept.
    pub fn expand(&self, text: &str) -> String {
        let vars = self.lock();
        VARIABLE
            .replace_all(text, |captures: &Captures| {
                let name = captures
                    .get(1)
                    .or_else(|| captures.get(2))
                    .map(|name| name.as_str())
                    .unwrap_or_default();

                vars.get(name)
                    .cloned()
                    .or_else(|| env::var(name).ok())
                    .unwrap_or_else(|| captures[0].to_string())
            })
            .into_owned()
    }

    pub fn write_env_file(&self, path: &Path) -> Result<()> {
        let mut content = String::new();
        for (key, value) in self.snapshot() {
            let _ = writeln!(content, "{}={}", key, value);
        }

        fs::write(path, content)
            .with_context(|| format!("could not write env file {}", path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.vars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `OKTETO_BUILD_<SERVICE>_<SUFFIX>`.
pub fn service_env_var(service: &str, suffix: &str) -> String {
    format!("OKTETO_BUILD_{}_{}", sanitize_service_name(service), suffix)
}

pub fn sanitize_service_name(service: &str) -> String {
    service.to_uppercase().replace('-', "_")
}

/// Publishes the image a service resolved to so dependent builds and the
/// deploy phase can refer to it.
#[derive(Clone)]
pub struct ServiceEnvVarsSetter {
    registry: Arc<dyn RegistryClient>,
    environment: BuildEnvironment,
}

impl ServiceEnvVarsSetter {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        environment: BuildEnvironment,
    ) -> ServiceEnvVarsSetter {
        ServiceEnvVarsSetter {
            registry,
            environment,
        }
    }

    pub fn environment(&self) -> &BuildEnvironment {
        &self.environment
    }

    pub fn set_service_env_vars(&self, service: &str, reference: &str) {
        let parsed = match self.registry.image_reference(reference) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    "could not parse image reference {:?} for service {}: {:#}",
                    reference, service, err
                );
                return;
            }
        };

        let vars = service_vars(service, &parsed);
        debug!("setting env vars for service {}: {:?}", service, vars);
        self.environment.set_all(vars);
    }
}

fn service_vars(service: &str, reference: &ImageReference) -> Vec<(String, String)> {
    let sha = if reference.tag.starts_with(DIGEST_PREFIX) {
        format!("okteto@{}", reference.tag)
    } else {
        reference.tag.clone()
    };

    vec![
        (service_env_var(service, REGISTRY_SUFFIX), reference.registry.clone()),
        (service_env_var(service, REPOSITORY_SUFFIX), reference.repository.clone()),
        (service_env_var(service, IMAGE_SUFFIX), reference.image.clone()),
        (service_env_var(service, TAG_SUFFIX), reference.tag.clone()),
        (service_env_var(service, SHA_SUFFIX), sha),
    ]
}
