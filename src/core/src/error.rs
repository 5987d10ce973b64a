use thiserror::Error;

/// imgrelay error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Reference without a digest where one is required
    #[error("Expected digest reference, got '{reference}': {reason}")]
    MissingDigest { reference: String, reason: String },

    /// Reference string could not be parsed at all
    #[error("Invalid image reference '{reference}': {reason}")]
    Reference { reference: String, reason: String },

    /// Copy source selection is invalid
    #[error("Invalid copy source: {0}")]
    SourceConflict(String),

    /// Copy destination selection is invalid
    #[error("Invalid copy destination: {0}")]
    DestinationConflict(String),

    /// --resume with anything but a tar destination
    #[error("Flag --resume can only be used when copying to a tar")]
    ResumeRequiresTarDst,

    /// --lock-output with anything but a repository destination
    #[error("Cannot output a lock file with a tar destination")]
    LockOutputRequiresRepoDst,

    /// A referenced image could not be fetched during closure resolution
    #[error("Unable to resolve '{reference}' while walking the image closure: {reason}")]
    UnreachableAncestor { reference: String, reason: String },

    /// A lock entry pointed at an image the run never copied
    #[error("Expected image '{reference}' to have been copied but it was not")]
    ImageNotCopied { reference: String },

    /// Copied images contain a bundle but none is marked as the root
    #[error(
        "Unable to determine the root bundle to use for lock output \
         (hint: if copying from a tar, try re-generating the tar)"
    )]
    RootBundleIndeterminate,

    /// Invariant violation; indicates a bug rather than bad input
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// Transport failure talking to a registry
    #[error("Registry error: {registry}: {message}")]
    Network { registry: String, message: String },

    /// The run was cancelled before completing
    #[error("Copy cancelled")]
    Cancelled,

    /// --bundle pointed at a plain image
    #[error("Expected bundle image but found plain image '{reference}' (hint: use --image for plain images)")]
    BundleExpected { reference: String },

    /// --image pointed at a bundle
    #[error("Expected plain image but found bundle '{reference}' (hint: use --bundle for bundles)")]
    PlainImageExpected { reference: String },

    /// Malformed ImagesLock/BundleLock content
    #[error("Lock file error: {0}")]
    Lockfile(String),

    /// Structural problem with a tar archive
    #[error("Tar archive error: {0}")]
    Tar(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Result type alias for imgrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
