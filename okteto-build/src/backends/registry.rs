use anyhow::{anyhow, Context};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::RegistryError,
    models::{ImageReference, DEV_REGISTRY, GLOBAL_REGISTRY},
    services::RegistryClient,
};

use super::command_output;

const GLOBAL_NAMESPACE: &str = "okteto";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maps the `okteto.dev` and `okteto.global` aliases to real repositories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryNames {
    pub url: String,
    pub namespace: String,
}

impl RegistryNames {
    pub fn new<U: Into<String>, N: Into<String>>(url: U, namespace: N) -> RegistryNames {
        RegistryNames {
            url: url.into(),
            namespace: namespace.into(),
        }
    }

    pub fn expand(&self, image: &str) -> String {
        if self.url.is_empty() {
            return image.to_string();
        }

        if let Some(rest) = image.strip_prefix(&format!("{}/", DEV_REGISTRY)) {
            format!("{}/{}/{}", self.url, self.namespace, rest)
        } else if let Some(rest) = image.strip_prefix(&format!("{}/", GLOBAL_REGISTRY)) {
            format!("{}/{}/{}", self.url, GLOBAL_NAMESPACE, rest)
        } else {
            image.to_string()
        }
    }

    pub fn is_okteto_registry(&self, image: &str) -> bool {
        image.starts_with(&format!("{}/", DEV_REGISTRY))
            || image.starts_with(&format!("{}/", GLOBAL_REGISTRY))
            || (!self.url.is_empty() && image.starts_with(&format!("{}/", self.url)))
    }
}

#[derive(Debug, Deserialize)]
struct InspectedManifest {
    digest: String,
}

/// Registry client on top of `docker buildx imagetools`.
pub struct DockerRegistry {
    names: RegistryNames,
    global_access: bool,
    timeout: Duration,
}

impl DockerRegistry {
    pub fn new(names: RegistryNames, global_access: bool) -> DockerRegistry {
        DockerRegistry {
            names,
            global_access,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl RegistryClient for DockerRegistry {
    async fn image_tag_with_digest(&self, reference: &str) -> Result<String, RegistryError> {
        let expanded = self.names.expand(reference);
        let args = vec![
            "buildx".to_string(),
            "imagetools".to_string(),
            "inspect".to_string(),
            expanded.clone(),
            "--format".to_string(),
            "{{json .Manifest}}".to_string(),
        ];

        let output = command_output("docker", &args, self.timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Err(RegistryError::NotFound(reference.to_string()));
            }
            return Err(anyhow!("could not inspect {}: {}", expanded, stderr.trim()).into());
        }

        let manifest: InspectedManifest = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("unexpected inspect output for {}", expanded))?;

        let digest_reference = with_digest(&expanded, &manifest.digest)?;
        debug!("{} resolved to {}", reference, digest_reference);
        Ok(digest_reference)
    }

    async fn has_global_push_access(&self) -> anyhow::Result<bool> {
        Ok(self.global_access)
    }

    fn is_okteto_registry(&self, image: &str) -> bool {
        self.names.is_okteto_registry(image)
    }

    async fn clone_image(&self, from: &str, to: &str) -> Result<String, RegistryError> {
        let source = self.names.expand(from);
        let target = self.names.expand(to);
        info!("copying {} to {}", source, target);

        let args = vec![
            "buildx".to_string(),
            "imagetools".to_string(),
            "create".to_string(),
            "--tag".to_string(),
            target.clone(),
            source.clone(),
        ];

        let output = command_output("docker", &args, self.timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Err(RegistryError::NotFound(from.to_string()));
            }
            return Err(
                anyhow!("could not copy {} to {}: {}", source, target, stderr.trim()).into(),
            );
        }

        self.image_tag_with_digest(to).await
    }
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("not found")
        || stderr.contains("manifest unknown")
        || stderr.contains("status: 404")
        || stderr.contains("status code 404")
}

/// `<registry>/<repository>@<digest>` for the image `reference` points to.
fn with_digest(reference: &str, digest: &str) -> anyhow::Result<String> {
    let parsed = ImageReference::parse(reference)?;
    let name = if parsed.is_digest() || reference.ends_with(&format!(":{}", parsed.tag)) {
        &reference[..reference.len() - parsed.tag.len() - 1]
    } else {
        reference
    };

    Ok(format!("{}@{}", name, digest))
}
