use crate::{
    config::BuilderConfig,
    models::{
        sanitize_name, BuildInfo, ImageReference, DEFAULT_IMAGE_TAG, DEV_REGISTRY,
        GLOBAL_REGISTRY, VOLUME_MOUNTS_TAG,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TagStyle {
    Plain,
    /// Tags carry a marker so images with baked-in volumes never shadow the
    /// plain service image.
    VolumeMounts,
}

/// Computes the candidate references a service image may live at.
#[derive(Clone, Debug)]
pub struct ImageTagger {
    config: BuilderConfig,
    style: TagStyle,
}

impl ImageTagger {
    pub fn new(config: BuilderConfig) -> ImageTagger {
        ImageTagger {
            config,
            style: TagStyle::Plain,
        }
    }

    pub fn with_volume_mounts(config: BuilderConfig) -> ImageTagger {
        ImageTagger {
            config,
            style: TagStyle::VolumeMounts,
        }
    }

    /// The reference a freshly built image is pushed to.
    ///
    /// A declared image is used as is. Otherwise the reference is inferred in
    /// the dev registry with the default tag, or in the global registry with
    /// the build hash when the image can be shared between users.
    pub fn service_image_reference(
        &self,
        manifest_name: &str,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> String {
        if self.style == TagStyle::Plain {
            if let Some(image) = info.explicit_image() {
                return image.to_string();
            }
            if !info.has_dockerfile() {
                return String::new();
            }
        }

        let sanitized = sanitize_name(manifest_name);
        if self.shares_globally(hash) {
            reference_template(GLOBAL_REGISTRY, &sanitized, service, &self.hash_tag(hash))
        } else {
            reference_template(DEV_REGISTRY, &sanitized, service, &self.default_tag())
        }
    }

    /// Every reference an image built with `hash` could have been pushed to.
    pub fn image_references_for_tag(
        &self,
        manifest_name: &str,
        service: &str,
        hash: &str,
    ) -> Vec<String> {
        if hash.is_empty() {
            return Vec::new();
        }
        self.references(manifest_name, service, &self.hash_tag(hash))
    }

    /// Hash candidates first, then the default tag candidates.
    pub fn image_references_for_tag_with_defaults(
        &self,
        manifest_name: &str,
        service: &str,
        hash: &str,
    ) -> Vec<String> {
        let mut references = self.image_references_for_tag(manifest_name, service, hash);
        references.extend(self.references(manifest_name, service, &self.default_tag()));
        references
    }

    /// Deploys only check for the image under the default tag. Global cache
    /// hits are cloned to the same reference.
    pub fn image_references_for_deploy(&self, manifest_name: &str, service: &str) -> Vec<String> {
        vec![reference_template(
            DEV_REGISTRY,
            &sanitize_name(manifest_name),
            service,
            &self.default_tag(),
        )]
    }

    /// Global `:<hash>` references to push next to any dev registry tag in
    /// `tags`, so other users can reuse the image.
    pub fn global_tags_for(&self, tags: &[String], hash: &str) -> Vec<String> {
        if !self.config.has_global_access || !self.config.smart_build.enabled || hash.is_empty() {
            return Vec::new();
        }

        tags.iter()
            .filter_map(|tag| ImageReference::parse(tag).ok())
            .filter(|reference| reference.registry == DEV_REGISTRY)
            .filter(|reference| !reference.repository.contains('/'))
            .map(|reference| format!("{}/{}:{}", GLOBAL_REGISTRY, reference.repository, hash))
            .collect()
    }

    pub fn target_registries(&self) -> Vec<&'static str> {
        if self.config.is_okteto {
            vec![DEV_REGISTRY, GLOBAL_REGISTRY]
        } else {
            Vec::new()
        }
    }

    fn references(&self, manifest_name: &str, service: &str, tag: &str) -> Vec<String> {
        let sanitized = sanitize_name(manifest_name);
        self.target_registries()
            .into_iter()
            .map(|registry| reference_template(registry, &sanitized, service, tag))
            .collect()
    }

    fn shares_globally(&self, hash: &str) -> bool {
        self.config.has_global_access
            && self.config.is_clean_project
            && self.config.smart_build.enabled
            && !hash.is_empty()
    }

    fn default_tag(&self) -> String {
        match self.style {
            TagStyle::Plain => DEFAULT_IMAGE_TAG.to_string(),
            TagStyle::VolumeMounts => VOLUME_MOUNTS_TAG.to_string(),
        }
    }

    fn hash_tag(&self, hash: &str) -> String {
        match self.style {
            TagStyle::Plain => hash.to_string(),
            TagStyle::VolumeMounts => format!("{}-{}", hash, VOLUME_MOUNTS_TAG),
        }
    }
}

fn reference_template(registry: &str, repository: &str, service: &str, tag: &str) -> String {
    format!("{}/{}-{}:{}", registry, repository, service, tag)
}
