use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use tracing::debug;

use fab_domain::{split_object_spec, ConfigError, ObjectCategory, PackagePath, OBJECT_CATEGORIES};

use crate::project::{ProjectNode, Target};
use crate::resolver::Resolver;

/// How a target's artifact is produced.
///
/// Alias and enrich are indirections resolved lazily at realization time;
/// the other kinds are concrete producers.
#[derive(Clone, Debug)]
pub enum Producer {
    /// A transparent rename of another object, possibly in another package.
    Alias { source: String },
    /// A parameterized clone of another object with overridden values.
    Enrich { source: String, with: Mapping },
    /// An opaque build worker executed in the sandboxed runtime.
    Worker {
        command: Vec<String>,
        /// Source files fed to the worker and fingerprinted into the
        /// cache key.
        files: Vec<String>,
        requirements: Vec<String>,
    },
    /// A static file shipped with the package.
    File { path: String },
}

pub struct ConstructRequest<'a> {
    pub package: &'a PackagePath,
    pub category: ObjectCategory,
    pub name: &'a str,
    pub config: &'a Mapping,
}

impl ConstructRequest<'_> {
    fn full_name(&self) -> String {
        format!("{}:{}", self.package, self.name)
    }

    fn str_key(&self, key: &str) -> Option<String> {
        str_key(self.config, key)
    }

    fn list_key(&self, key: &str) -> Vec<String> {
        match self.config.get(Value::from(key)) {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
            Some(Value::String(item)) => vec![item.clone()],
            _ => Vec::new(),
        }
    }
}

fn str_key(config: &Mapping, key: &str) -> Option<String> {
    config
        .get(Value::from(key))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

pub type Constructor =
    Box<dyn Fn(&ConstructRequest<'_>) -> Result<Producer, ConfigError> + Send + Sync>;

/// Maps `(category, type)` to a producer constructor.
///
/// Registered once at start-up and looked up through a single indirection,
/// so embedders can plug in new producer kinds without touching dispatch.
pub struct FactoryRegistry {
    constructors: HashMap<(ObjectCategory, String), Constructor>,
}

impl FactoryRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The built-in producer kinds, available in every category.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for category in OBJECT_CATEGORIES {
            registry.register(category, "alias", Box::new(construct_alias));
            registry.register(category, "enrich", Box::new(construct_enrich));
            registry.register(category, "worker", Box::new(construct_worker));
            registry.register(category, "file", Box::new(construct_file));
        }
        registry
    }

    pub fn register(&mut self, category: ObjectCategory, kind: &str, constructor: Constructor) {
        self.constructors
            .insert((category, kind.to_string()), constructor);
    }

    /// Instantiates (or returns the already-instantiated) object declared
    /// as `(category, name)` in `project`.
    ///
    /// # Errors
    ///
    /// `BrokenPackage` when the node is broken, `BadObject` when the entry
    /// is missing or malformed, `UnknownType` when no constructor matches.
    pub fn construct(
        &self,
        project: &Arc<ProjectNode>,
        category: ObjectCategory,
        name: &str,
    ) -> Result<Arc<Target>, ConfigError> {
        if project.broken {
            return Err(ConfigError::BrokenPackage(project.name.to_string()));
        }
        let target = project.get_or_insert_object(category, name, || {
            let entry = project.object_entry(category, name).ok_or_else(|| {
                ConfigError::BadObject {
                    object: format!("{}:{name}", project.name),
                    reason: format!("no such {category}"),
                }
            })?;
            let kind = entry.kind.clone().ok_or_else(|| ConfigError::BadObject {
                object: format!("{}:{name}", project.name),
                reason: "missing `type`".to_string(),
            })?;
            let request = ConstructRequest {
                package: &project.name,
                category,
                name,
                config: &entry.config,
            };
            let constructor = self
                .constructors
                .get(&(category, kind.clone()))
                .ok_or_else(|| ConfigError::UnknownType {
                    object: request.full_name(),
                    kind: kind.clone(),
                    category: category.to_string(),
                })?;
            let producer = constructor(&request)?;
            debug!("instantiated {} as {kind}", request.full_name());
            Ok(Target::new(
                name.to_string(),
                category,
                entry.config.clone(),
                producer,
                project,
            ))
        })?;
        target.acquire();
        Ok(target)
    }
}

/// Resolves the alias/enrich source reference of `config` into a single
/// `<package>:<object>` spec string, resolved lazily against the
/// declaring package at realization time.
fn source_spec(request: &ConstructRequest<'_>) -> Result<String, ConfigError> {
    let package = request
        .str_key("package")
        .or_else(|| request.str_key("project"));
    let source = request.str_key("source");
    if source.is_none() && package.is_none() {
        return Err(ConfigError::BadObject {
            object: request.full_name(),
            reason: "needs either the source object name or the source package name".to_string(),
        });
    }
    let name = source.unwrap_or_else(|| request.name.to_string());
    Ok(match package.as_deref() {
        None | Some("this" | "") => name,
        Some(package) => format!("{package}:{name}"),
    })
}

fn construct_alias(request: &ConstructRequest<'_>) -> Result<Producer, ConfigError> {
    Ok(Producer::Alias {
        source: source_spec(request)?,
    })
}

fn construct_enrich(request: &ConstructRequest<'_>) -> Result<Producer, ConfigError> {
    let with = request
        .config
        .get(Value::from("with"))
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    Ok(Producer::Enrich {
        source: source_spec(request)?,
        with,
    })
}

fn construct_worker(request: &ConstructRequest<'_>) -> Result<Producer, ConfigError> {
    let command = request.list_key("command");
    if command.is_empty() {
        return Err(ConfigError::BadObject {
            object: request.full_name(),
            reason: "worker needs a `command`".to_string(),
        });
    }
    Ok(Producer::Worker {
        command,
        files: request.list_key("files"),
        requirements: request.list_key("requirements"),
    })
}

fn construct_file(request: &ConstructRequest<'_>) -> Result<Producer, ConfigError> {
    let path = request.str_key("path").ok_or_else(|| ConfigError::BadObject {
        object: request.full_name(),
        reason: "file producer needs a `path`".to_string(),
    })?;
    Ok(Producer::File { path })
}

/// An alias/enrich chain collapsed down to its innermost concrete target.
pub struct ResolvedProducer {
    pub target: Arc<Target>,
    /// The concrete target's configuration with all collapsed `with:`
    /// overrides applied.
    pub config: Mapping,
}

/// Walks an alias/enrich chain to its concrete producer.
///
/// Sources resolve lazily; a visited set keyed by the resolved source
/// identifier refuses re-entry so cyclic chains raise instead of
/// recursing. `with:` overrides collapse outward-in: the outermost value
/// wins over anything inner.
pub(crate) async fn resolve_chain(
    resolver: &Arc<Resolver>,
    start: &Arc<Target>,
) -> anyhow::Result<ResolvedProducer> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut overrides = Mapping::new();
    let mut current = start.clone();
    loop {
        let full = current.full_name();
        if !visited.insert(full.clone()) {
            return Err(ConfigError::SourceCycle {
                object: start.full_name(),
                target: full,
            }
            .into());
        }
        let source = match &current.producer {
            Producer::Alias { source } => source.clone(),
            Producer::Enrich { source, with } => {
                for (key, value) in with {
                    // The outermost override was recorded first and wins.
                    if !overrides.contains_key(key) {
                        overrides.insert(key.clone(), value.clone());
                    }
                }
                source.clone()
            }
            _ => break,
        };
        current = follow_source(resolver, &current, &source).await?;
    }

    let mut config = current.config.clone();
    if !overrides.is_empty() {
        apply_parameter_overrides(&mut config, &overrides, &current.full_name())?;
    }
    Ok(ResolvedProducer {
        target: current,
        config,
    })
}

async fn follow_source(
    resolver: &Arc<Resolver>,
    current: &Arc<Target>,
    source: &str,
) -> anyhow::Result<Arc<Target>> {
    let project = current.project().ok_or_else(|| ConfigError::BadObject {
        object: current.full_name(),
        reason: "owning package was discarded".to_string(),
    })?;
    let (package, object) = split_object_spec(&project.name, source);
    let node = resolver
        .get_project_at(&package)
        .await?
        .ok_or_else(|| ConfigError::PackageNotFound(package.to_string()))?;
    Ok(resolver
        .registry()
        .construct(&node, current.category, &object)?)
}

/// Applies collapsed `with:` values onto the concrete config's declared
/// parameters, the only place overrides are allowed to land.
fn apply_parameter_overrides(
    config: &mut Mapping,
    overrides: &Mapping,
    object: &str,
) -> Result<(), ConfigError> {
    let parameters = config
        .get_mut(Value::from("parameters"))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| ConfigError::BadObject {
            object: object.to_string(),
            reason: "attempting to parametrize an object that has no parameters".to_string(),
        })?;
    for (key, value) in overrides {
        let parameter = parameters
            .get_mut(key)
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| ConfigError::BadObject {
                object: object.to_string(),
                reason: format!(
                    "attempting to parametrize with an unknown parameter: {}",
                    key.as_str().unwrap_or("<non-string>")
                ),
            })?;
        parameter.insert(Value::from("default"), value.clone());
    }
    Ok(())
}
