use thiserror::Error;

/// Configuration problems are surfaced to the caller and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("package configuration not found: {0}")]
    ManifestMissing(String),
    #[error("{package}: failed to parse the package configuration: {reason}")]
    ManifestInvalid { package: String, reason: String },
    #[error("{package}: engine version {version} does not satisfy required `{required}`")]
    IncompatibleVersion {
        package: String,
        version: String,
        required: String,
    },
    #[error("{package}: invalid dependency `{name}`: {reason}")]
    BadDependency {
        package: String,
        name: String,
        reason: String,
    },
    #[error("{object}: unknown producer type `{kind}` for {category}")]
    UnknownType {
        object: String,
        kind: String,
        category: String,
    },
    #[error("{object}: alias/enrich chain loops back to {target}")]
    SourceCycle { object: String, target: String },
    #[error("{object}: {reason}")]
    BadObject { object: String, reason: String },
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("{0}: the package is broken (its configuration failed to load)")]
    BrokenPackage(String),
}

/// Failures while materializing a package's files on local disk.
///
/// Only the transient-network class is retried; everything else aborts the
/// affected branch of the graph immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("fetch failed: {0}")]
    Failed(String),
    #[error("{0} is not cached and the engine is offline")]
    Offline(String),
}

impl FetchError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A producer subprocess reported failure for one object.
///
/// The object is left without a cached artifact; the graph stays usable.
#[derive(Debug, Error)]
#[error("{object}: {message}")]
pub struct BuildError {
    pub object: String,
    pub message: String,
}

impl BuildError {
    #[must_use]
    pub fn new(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            message: message.into(),
        }
    }
}

/// Cache I/O problems. Never surfaced to callers; every cache failure
/// degrades to a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(String),
}
