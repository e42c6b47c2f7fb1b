use anyhow::anyhow;
use log::{debug, info};
use std::sync::Arc;

use crate::{
    error::RegistryError,
    models::BuildInfo,
    services::RegistryClient,
    tagger::ImageTagger,
};

/// A previously built image found in the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHit {
    /// The candidate reference that matched.
    pub candidate: String,
    /// The same image, digest qualified.
    pub reference: String,
}

pub struct ImageChecker {
    registry: Arc<dyn RegistryClient>,
    tagger: ImageTagger,
    volume_tagger: ImageTagger,
    is_okteto: bool,
}

impl ImageChecker {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        tagger: ImageTagger,
        volume_tagger: ImageTagger,
        is_okteto: bool,
    ) -> ImageChecker {
        ImageChecker {
            registry,
            tagger,
            volume_tagger,
            is_okteto,
        }
    }

    /// Looks for an image built from `hash`. `Ok(None)` is a miss; errors
    /// mean the registry could not answer and the result is unknown.
    ///
    /// Services with volume mounts are looked up under their
    /// `-okteto-with-volume-mounts` hash tags.
    pub async fn check_if_build_hash_is_built(
        &self,
        manifest_name: &str,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> Result<Option<CacheHit>, RegistryError> {
        if hash.is_empty() {
            return Ok(None);
        }

        let tagger = if info.has_volumes() {
            &self.volume_tagger
        } else {
            &self.tagger
        };
        let candidates = tagger.image_references_for_tag(manifest_name, service, hash);
        self.first_found(&candidates).await
    }

    /// Resolves the digest reference of the image a service currently points to.
    pub async fn image_digest_reference_for_service(
        &self,
        manifest_name: &str,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> Result<String, RegistryError> {
        let candidates = self.candidates_for_service(manifest_name, service, info, hash);

        match self.first_found(&candidates).await? {
            Some(hit) => Ok(hit.reference),
            None => Err(RegistryError::NotFound(format!("[{}]", candidates.join(", ")))),
        }
    }

    pub fn candidates_for_service(
        &self,
        manifest_name: &str,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> Vec<String> {
        let literal = || {
            info.explicit_image()
                .map(|image| vec![image.to_string()])
                .unwrap_or_default()
        };

        if info.has_volumes() {
            if !self.is_okteto {
                return literal();
            }
            return self
                .volume_tagger
                .image_references_for_tag_with_defaults(manifest_name, service, hash);
        }

        if info.has_dockerfile() && info.explicit_image().is_none() {
            return self
                .tagger
                .image_references_for_tag_with_defaults(manifest_name, service, hash);
        }

        literal()
    }

    async fn first_found(
        &self,
        candidates: &[String],
    ) -> Result<Option<CacheHit>, RegistryError> {
        for candidate in candidates {
            match self.registry.image_tag_with_digest(candidate).await {
                Ok(reference) => {
                    info!("image {} found", candidate);
                    return Ok(Some(CacheHit {
                        candidate: candidate.clone(),
                        reference,
                    }));
                }
                Err(err) if err.is_not_found() => {
                    debug!("image {} not found", candidate);
                }
                Err(err) => {
                    return Err(RegistryError::Other(anyhow!(
                        "error checking image at registry {}: {}",
                        candidate,
                        err
                    )))
                }
            }
        }

        Ok(None)
    }
}
