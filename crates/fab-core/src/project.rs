use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_yaml::Mapping;
use tracing::{debug, error};

use fab_domain::{
    ConfigError, Manifest, ObjectCategory, ObjectEntry, PackagePath, MANIFEST_FILENAME,
};

use crate::registry::Producer;

/// Opaque producer output, cached per target until invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content: Vec<u8>,
}

/// One resolved package: parsed manifest, filesystem location, and the
/// registries of lazily-instantiated build objects.
///
/// Created exactly once per [`PackagePath`] and kept for the life of the
/// resolver.
pub struct ProjectNode {
    pub name: PackagePath,
    /// Filesystem root of the materialized package.
    pub path: PathBuf,
    pub manifest: Manifest,
    /// Set when the manifest failed to parse or was missing. A broken node
    /// participates in the graph but errors when objects are requested.
    pub broken: bool,
    /// Configuration keys inherited from the importing package.
    pub inherited: Mapping,
    objects: RwLock<HashMap<(ObjectCategory, String), Arc<Target>>>,
}

impl ProjectNode {
    /// Loads the package at `path`, registering a broken node when its
    /// manifest is missing or unparseable.
    ///
    /// # Errors
    ///
    /// Only an unsatisfied `requiredVersion` gate is a hard error;
    /// everything else degrades to `broken = true`.
    pub fn load(
        name: PackagePath,
        path: PathBuf,
        inherited: Mapping,
        allow_missing: bool,
    ) -> Result<Arc<Self>, ConfigError> {
        let manifest = match Manifest::load(&path, name.as_str()) {
            Ok(manifest) => manifest,
            Err(err @ ConfigError::IncompatibleVersion { .. }) => return Err(err),
            Err(ConfigError::ManifestMissing(reported)) if allow_missing => {
                debug!("{name}: no manifest at {reported}, treating as an empty package");
                Manifest::default()
            }
            Err(err) => {
                error!("{name}: {err}");
                return Ok(Arc::new(Self {
                    name,
                    path,
                    manifest: Manifest::default(),
                    broken: true,
                    inherited,
                    objects: RwLock::new(HashMap::new()),
                }));
            }
        };
        Ok(Arc::new(Self {
            name,
            path,
            manifest,
            broken: false,
            inherited,
            objects: RwLock::new(HashMap::new()),
        }))
    }

    /// Whether `name` is an on-disk subfolder carrying its own manifest.
    #[must_use]
    pub fn has_package_subfolder(&self, name: &str) -> bool {
        self.path.join(name).join(MANIFEST_FILENAME).is_file()
    }

    #[must_use]
    pub fn object_entry(&self, category: ObjectCategory, name: &str) -> Option<&ObjectEntry> {
        self.manifest.object(category, name)
    }

    /// Returns the already-instantiated object, if any.
    #[must_use]
    pub fn instantiated_object(&self, category: ObjectCategory, name: &str) -> Option<Arc<Target>> {
        let objects = self
            .objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        objects.get(&(category, name.to_string())).cloned()
    }

    /// Registers `make`'s result under `(category, name)` unless another
    /// caller won the race, in which case theirs is returned.
    pub(crate) fn get_or_insert_object(
        &self,
        category: ObjectCategory,
        name: &str,
        make: impl FnOnce() -> Result<Target, ConfigError>,
    ) -> Result<Arc<Target>, ConfigError> {
        if let Some(existing) = self.instantiated_object(category, name) {
            return Ok(existing);
        }
        let made = Arc::new(make()?);
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = objects
            .entry((category, name.to_string()))
            .or_insert(made)
            .clone();
        Ok(entry)
    }
}

/// A named, typed build object declared in a manifest.
///
/// Holds a non-owning back-reference to its project so owner and owned
/// never form a reference cycle.
#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub category: ObjectCategory,
    pub config: Mapping,
    pub producer: Producer,
    project: Weak<ProjectNode>,
    artifact: Mutex<Option<Arc<Artifact>>>,
    refs: AtomicU64,
}

impl Target {
    #[must_use]
    pub fn new(
        name: String,
        category: ObjectCategory,
        config: Mapping,
        producer: Producer,
        project: &Arc<ProjectNode>,
    ) -> Self {
        Self {
            name,
            category,
            config,
            producer,
            project: Arc::downgrade(project),
            artifact: Mutex::new(None),
            refs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn project(&self) -> Option<Arc<ProjectNode>> {
        self.project.upgrade()
    }

    /// Fully-qualified `<package>:<name>` for error reporting.
    #[must_use]
    pub fn full_name(&self) -> String {
        match self.project() {
            Some(project) => format!("{}:{}", project.name, self.name),
            None => format!(":{}", self.name),
        }
    }

    #[must_use]
    pub fn cached_artifact(&self) -> Option<Arc<Artifact>> {
        self.artifact
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn store_artifact(&self, artifact: Arc<Artifact>) {
        *self
            .artifact
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(artifact);
    }

    /// Drops the cached artifact so the next request recomputes it.
    pub fn invalidate(&self) {
        *self
            .artifact
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Counts one more consumer of this object.
    pub fn acquire(&self) -> u64 {
        self.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::Relaxed)
    }
}

/// Loads a node directly from a directory, used by tests and embedders
/// that bypass the resolver.
///
/// # Errors
///
/// See [`ProjectNode::load`].
pub fn load_standalone(path: &Path) -> Result<Arc<ProjectNode>, ConfigError> {
    ProjectNode::load(
        PackagePath::root(),
        path.to_path_buf(),
        Mapping::new(),
        false,
    )
}
