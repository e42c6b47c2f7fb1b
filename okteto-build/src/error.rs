use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The reference does not exist in the registry. This is the expected
    /// signal for a cache miss, not a failure.
    #[error("image {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("the id '{0}' is already known")]
    DuplicateNode(String),

    #[error("src ('{0}') and dst ('{0}') equal")]
    SelfDependency(String),

    #[error(
        "service '{service}' depends on '{dependency}', \
         which is not defined in the build section"
    )]
    UnknownDependency { service: String, dependency: String },

    #[error("edge between '{from}' and '{to}' would create a loop")]
    Cycle { from: String, to: String },

    #[error("the id '{0}' is not part of the graph")]
    UnknownNode(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no services to build defined")]
    NoServicesToBuild,

    #[error("invalid services names, not found at manifest: [{}]", .0.join(", "))]
    UnknownServices(Vec<String>),

    #[error(
        "flags only allowed when building a single image: \
         --tag, --target, --cache-from, --secret"
    )]
    FlagsOnlyForSingleImage,

    #[error("'build.{0}.image' is required if your context is not managed by Okteto")]
    ImageRequired(String),

    #[error("build with volume mounts is not supported on vanilla clusters (service '{0}')")]
    VolumeMountsUnsupported(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("error building service '{service}': {cause}")]
    Service { service: String, cause: anyhow::Error },

    #[error("error accessing image at registry {reference}: {cause}")]
    DigestConfirmation {
        reference: String,
        cause: RegistryError,
    },

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
