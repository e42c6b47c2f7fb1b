use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::{
    error::RegistryError,
    models::{BuildOptions, ImageReference, Manifest},
};

pub trait ManifestFrontend {
    fn manifest(&mut self, manifest_name: &str, manifest_path: &Path) -> Result<Manifest>;
}

/// Produces and pushes an image. How the image gets built is up to the runner.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, options: &BuildOptions) -> Result<()>;
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Returns the digest qualified form of `reference`, or
    /// [`RegistryError::NotFound`] if the registry does not have it.
    async fn image_tag_with_digest(&self, reference: &str) -> Result<String, RegistryError>;

    async fn has_global_push_access(&self) -> Result<bool>;

    fn is_okteto_registry(&self, image: &str) -> bool;

    /// Copies `from` to `to` inside the registry and returns the digest
    /// qualified form of `to`.
    async fn clone_image(&self, from: &str, to: &str) -> Result<String, RegistryError>;

    fn image_reference(&self, image: &str) -> Result<ImageReference> {
        ImageReference::parse(image)
    }
}

pub trait RepositoryInfo: Send + Sync {
    fn sha(&self) -> Result<String>;

    /// Latest commit that touched `path`.
    fn latest_dir_sha(&self, path: &Path) -> Result<String>;

    /// Hash of the uncommitted changes below `path`.
    fn diff_hash(&self, path: &Path) -> Result<String>;

    fn is_clean(&self) -> Result<bool>;

    fn anonymized_repo(&self) -> String;
}
