mod config;
mod error;
mod manifest;
mod path;

pub use config::{EngineConfig, EnvSnapshot, GitRetryConfig, SandboxKind};
pub use error::{BuildError, CacheError, ConfigError, FetchError};
pub use manifest::{
    DependencyConfig, ImportDescriptor, ImportKind, Manifest, ObjectCategory, ObjectEntry,
    OBJECT_CATEGORIES,
};
pub use path::{split_object_spec, PackagePath, ROOT};

/// Name of the declarative configuration file at every package root.
pub const MANIFEST_FILENAME: &str = "fab.yaml";

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
