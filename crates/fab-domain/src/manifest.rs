use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use semver::{Version, VersionReq};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::ConfigError;
use crate::{ENGINE_VERSION, MANIFEST_FILENAME};

/// Categories of buildable objects a package may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectCategory {
    Sketch,
    Part,
    Assembly,
    Provider,
    Repository,
}

pub const OBJECT_CATEGORIES: [ObjectCategory; 5] = [
    ObjectCategory::Sketch,
    ObjectCategory::Part,
    ObjectCategory::Assembly,
    ObjectCategory::Provider,
    ObjectCategory::Repository,
];

impl ObjectCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sketch => "sketch",
            Self::Part => "part",
            Self::Assembly => "assembly",
            Self::Provider => "provider",
            Self::Repository => "repository",
        }
    }

    /// The manifest section holding this category's entries.
    #[must_use]
    pub fn section(self) -> &'static str {
        match self {
            Self::Sketch => "sketches",
            Self::Part => "parts",
            Self::Assembly => "assemblies",
            Self::Provider => "providers",
            Self::Repository => "repositories",
        }
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dependency's files are materialized on local disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImportKind {
    Local,
    Git,
    Archive,
}

impl ImportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Git => "git",
            Self::Archive => "archive",
        }
    }
}

impl TryFrom<&str> for ImportKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "local" => Ok(Self::Local),
            "git" => Ok(Self::Git),
            "archive" => Ok(Self::Archive),
            other => Err(format!("unknown import type `{other}`")),
        }
    }
}

/// One `dependencies:` entry, immutable once parsed.
#[derive(Clone, Debug)]
pub struct DependencyConfig {
    pub kind: ImportKind,
    /// Filesystem path (local) or URL (git/archive).
    pub location: String,
    pub revision: Option<String>,
    /// Directory inside the fetched tree holding the actual package.
    pub subpath: Option<String>,
    /// Resolve against the root package instead of the declaring one.
    pub only_in_root: bool,
    /// Configuration keys propagated into the imported package.
    pub inherited: Mapping,
}

impl DependencyConfig {
    fn parse(package: &str, name: &str, value: &Value) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::BadDependency {
            package: package.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let map = value.as_mapping().ok_or_else(|| bad("not a mapping"))?;
        let path = str_value(map, "path");
        let url = str_value(map, "url");

        let kind = match str_value(map, "type") {
            Some(raw) => ImportKind::try_from(raw.as_str())
                .map_err(|reason| bad(&reason))?,
            // The import type can be omitted: infer it from the location.
            None => match (&url, &path) {
                (Some(url), _) if looks_like_archive(url) => ImportKind::Archive,
                (Some(_), _) => ImportKind::Git,
                (None, Some(_)) => ImportKind::Local,
                (None, None) => return Err(bad("needs either `url` or `path`")),
            },
        };

        let location = match kind {
            ImportKind::Local => path.ok_or_else(|| bad("local import needs `path`"))?,
            ImportKind::Git | ImportKind::Archive => {
                url.ok_or_else(|| bad("remote import needs `url`"))?
            }
        };

        Ok(Self {
            kind,
            location,
            revision: str_value(map, "revision"),
            subpath: str_value(map, "subpath").or_else(|| str_value(map, "relPath")),
            only_in_root: bool_value(map, "onlyInRoot"),
            inherited: map
                .get(Value::from("inheritedConfig"))
                .and_then(Value::as_mapping)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// A fully-addressed import: a dependency entry (or discovered subfolder)
/// bound to the package path it will be registered under.
#[derive(Clone, Debug)]
pub struct ImportDescriptor {
    pub name: crate::PackagePath,
    pub kind: ImportKind,
    pub location: String,
    pub revision: Option<String>,
    pub subpath: Option<String>,
    pub inherited: Mapping,
}

impl ImportDescriptor {
    #[must_use]
    pub fn from_dependency(name: crate::PackagePath, dep: &DependencyConfig) -> Self {
        Self {
            name,
            kind: dep.kind,
            location: dep.location.clone(),
            revision: dep.revision.clone(),
            subpath: dep.subpath.clone(),
            inherited: dep.inherited.clone(),
        }
    }

    /// A discovered on-disk subfolder behaves as an implicit local import.
    #[must_use]
    pub fn local(name: crate::PackagePath, path: impl Into<String>) -> Self {
        Self {
            name,
            kind: ImportKind::Local,
            location: path.into(),
            revision: None,
            subpath: None,
            inherited: Mapping::new(),
        }
    }
}

fn looks_like_archive(url: &str) -> bool {
    url.ends_with(".tar.gz") || url.ends_with(".tgz") || url.ends_with(".zip")
}

/// One entry of an object section, with the producer type split out.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub kind: Option<String>,
    pub config: Mapping,
}

/// A package's parsed declarative configuration.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    pub desc: Option<String>,
    pub dependencies: IndexMap<String, DependencyConfig>,
    /// External dependency specs to install into the sandbox for this
    /// package's producers.
    pub requirements: Vec<String>,
    /// Interpreter version for sandboxed execution, if pinned.
    pub runtime_version: Option<String>,
    objects: IndexMap<(ObjectCategory, String), ObjectEntry>,
}

impl Manifest {
    /// Loads and parses the manifest at `dir`.
    ///
    /// # Errors
    ///
    /// `ManifestMissing` when there is no configuration file,
    /// `ManifestInvalid` when it cannot be parsed, and
    /// `IncompatibleVersion` when a `requiredVersion` gate fails; the
    /// latter is a hard abort, not a broken-package condition.
    pub fn load(dir: &Path, package_name: &str) -> Result<Self, ConfigError> {
        let manifest_path = dir.join(MANIFEST_FILENAME);
        if !manifest_path.is_file() {
            return Err(ConfigError::ManifestMissing(
                manifest_path.display().to_string(),
            ));
        }
        let text = fs::read_to_string(&manifest_path).map_err(|err| {
            ConfigError::ManifestInvalid {
                package: package_name.to_string(),
                reason: err.to_string(),
            }
        })?;
        Self::parse(&text, package_name)
    }

    /// Parses manifest text after template expansion.
    ///
    /// # Errors
    ///
    /// See [`Manifest::load`].
    pub fn parse(text: &str, package_name: &str) -> Result<Self, ConfigError> {
        let expanded = expand_templates(text, package_name);
        let value: Value =
            serde_yaml::from_str(&expanded).map_err(|err| ConfigError::ManifestInvalid {
                package: package_name.to_string(),
                reason: err.to_string(),
            })?;
        // An empty file is a valid, empty package.
        let mut map = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(map) => map,
            other => {
                return Err(ConfigError::ManifestInvalid {
                    package: package_name.to_string(),
                    reason: format!("expected a mapping, found {}", type_name(&other)),
                })
            }
        };

        check_required_version(&map, package_name)?;
        normalize_legacy_keys(&mut map, package_name);

        let mut manifest = Self {
            desc: str_value(&map, "desc"),
            runtime_version: str_value(&map, "runtimeVersion"),
            requirements: requirement_list(&map),
            ..Self::default()
        };

        if let Some(deps) = map.get(Value::from("dependencies")).and_then(Value::as_mapping) {
            for (key, value) in deps {
                let Some(name) = key.as_str() else { continue };
                let config = DependencyConfig::parse(package_name, name, value)?;
                manifest.dependencies.insert(name.to_string(), config);
            }
        }

        for category in OBJECT_CATEGORIES {
            let Some(section) = map.get(Value::from(category.section())).and_then(Value::as_mapping)
            else {
                continue;
            };
            for (key, value) in section {
                let Some(name) = key.as_str() else { continue };
                let entry = object_entry(name, value);
                manifest
                    .objects
                    .insert((category, name.to_string()), entry);
            }
        }

        Ok(manifest)
    }

    #[must_use]
    pub fn object(&self, category: ObjectCategory, name: &str) -> Option<&ObjectEntry> {
        self.objects.get(&(category, name.to_string()))
    }

    pub fn objects_in(
        &self,
        category: ObjectCategory,
    ) -> impl Iterator<Item = (&str, &ObjectEntry)> {
        self.objects
            .iter()
            .filter(move |((cat, _), _)| *cat == category)
            .map(|((_, name), entry)| (name.as_str(), entry))
    }
}

fn object_entry(name: &str, value: &Value) -> ObjectEntry {
    let mut config = match value {
        // A bare string is shorthand for an alias of that source.
        Value::String(source) => {
            let mut map = Mapping::new();
            map.insert(Value::from("type"), Value::from("alias"));
            map.insert(Value::from("source"), Value::from(source.clone()));
            map
        }
        Value::Mapping(map) => map.clone(),
        _ => Mapping::new(),
    };
    config
        .entry(Value::from("name"))
        .or_insert_with(|| Value::from(name));
    ObjectEntry {
        kind: str_value(&config, "type"),
        config,
    }
}

fn check_required_version(map: &Mapping, package_name: &str) -> Result<(), ConfigError> {
    let Some(required) = str_value(map, "requiredVersion") else {
        return Ok(());
    };
    let requirement =
        VersionReq::parse(&required).map_err(|err| ConfigError::ManifestInvalid {
            package: package_name.to_string(),
            reason: format!("invalid requiredVersion `{required}`: {err}"),
        })?;
    let version = Version::parse(ENGINE_VERSION).map_err(|err| ConfigError::ManifestInvalid {
        package: package_name.to_string(),
        reason: format!("engine version is not semver: {err}"),
    })?;
    if !requirement.matches(&version) {
        return Err(ConfigError::IncompatibleVersion {
            package: package_name.to_string(),
            version: ENGINE_VERSION.to_string(),
            required,
        });
    }
    Ok(())
}

fn normalize_legacy_keys(map: &mut Mapping, package_name: &str) {
    let import_key = Value::from("import");
    let deps_key = Value::from("dependencies");
    if map.contains_key(&import_key) && !map.contains_key(&deps_key) {
        warn!(
            "{package_name}: the `import` key is deprecated, use `dependencies` instead"
        );
        if let Some(value) = map.remove(&import_key) {
            map.insert(deps_key, value);
        }
    }
}

fn requirement_list(map: &Mapping) -> Vec<String> {
    match map.get(Value::from("requirements")) {
        Some(Value::String(block)) => block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ToString::to_string)
            .collect(),
        Some(Value::Sequence(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Expands `{{ ... }}` template expressions before parsing.
///
/// Supported substitutions are the package name and a small table of
/// numeric constants; unknown expressions are left verbatim.
fn expand_templates(text: &str, package_name: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = after[..end].trim();
        match template_value(token, package_name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn template_value(token: &str, package_name: &str) -> Option<String> {
    let value = match token {
        "package_name" => return Some(package_name.to_string()),
        "PI" | "M_PI" => std::f64::consts::PI,
        "SQRT_2" => std::f64::consts::SQRT_2,
        "SQRT_3" => 1.732_050_807_568_877_2,
        "SQRT_5" => 2.236_067_977_499_79,
        "INCH" | "INCHES" => 25.4,
        "FOOT" | "FEET" => 304.8,
        _ => return None,
    };
    Some(format!("{value}"))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn str_value(map: &Mapping, key: &str) -> Option<String> {
    map.get(Value::from(key))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn bool_value(map: &Mapping, key: &str) -> bool {
    map.get(Value::from(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dependencies_and_objects() -> Result<(), ConfigError> {
        let manifest = Manifest::parse(
            "desc: demo package\n\
             dependencies:\n\
               sub:\n\
                 path: sub\n\
               ext:\n\
                 url: https://example.com/ext.git\n\
                 revision: v1.2.0\n\
               blobs:\n\
                 url: https://example.com/blobs.tar.gz\n\
             parts:\n\
               cube:\n\
                 type: worker\n\
                 command: [make-cube]\n\
               cube2: 'cube'\n",
            "//demo",
        )?;

        assert_eq!(manifest.desc.as_deref(), Some("demo package"));
        assert_eq!(manifest.dependencies["sub"].kind, ImportKind::Local);
        assert_eq!(manifest.dependencies["ext"].kind, ImportKind::Git);
        assert_eq!(
            manifest.dependencies["ext"].revision.as_deref(),
            Some("v1.2.0")
        );
        assert_eq!(manifest.dependencies["blobs"].kind, ImportKind::Archive);

        let cube = manifest.object(ObjectCategory::Part, "cube").unwrap();
        assert_eq!(cube.kind.as_deref(), Some("worker"));
        let alias = manifest.object(ObjectCategory::Part, "cube2").unwrap();
        assert_eq!(alias.kind.as_deref(), Some("alias"));
        assert_eq!(
            alias.config.get(Value::from("source")).and_then(Value::as_str),
            Some("cube")
        );
        Ok(())
    }

    #[test]
    fn legacy_import_key_still_parses() -> Result<(), ConfigError> {
        let manifest = Manifest::parse("import:\n  sub:\n    path: sub\n", "//demo")?;
        assert!(manifest.dependencies.contains_key("sub"));
        Ok(())
    }

    #[test]
    fn expands_package_name_and_constants() -> Result<(), ConfigError> {
        let manifest = Manifest::parse(
            "parts:\n\
               plate:\n\
                 type: worker\n\
                 label: '{{ package_name }}'\n\
                 width: {{ INCH }}\n",
            "//demo",
        )?;
        let plate = manifest.object(ObjectCategory::Part, "plate").unwrap();
        assert_eq!(
            plate.config.get(Value::from("label")).and_then(Value::as_str),
            Some("//demo")
        );
        assert_eq!(
            plate.config.get(Value::from("width")).and_then(Value::as_f64),
            Some(25.4)
        );
        Ok(())
    }

    #[test]
    fn unknown_templates_are_left_verbatim() {
        assert_eq!(
            expand_templates("a {{ mystery }} b", "//demo"),
            "a {{ mystery }} b"
        );
    }

    #[test]
    fn version_gate_aborts_on_mismatch() {
        let err = Manifest::parse("requiredVersion: '>=99.0'\n", "//demo").unwrap_err();
        assert!(matches!(err, ConfigError::IncompatibleVersion { .. }));
        assert!(Manifest::parse("requiredVersion: '>=0.1'\n", "//demo").is_ok());
    }

    #[test]
    fn empty_manifest_is_a_valid_empty_package() -> Result<(), ConfigError> {
        let manifest = Manifest::parse("", "//demo")?;
        assert!(manifest.dependencies.is_empty());
        Ok(())
    }

    #[test]
    fn dependency_without_location_is_rejected() {
        let err = Manifest::parse("dependencies:\n  bad: {}\n", "//demo").unwrap_err();
        assert!(matches!(err, ConfigError::BadDependency { .. }));
    }

    #[test]
    fn requirement_block_and_list_forms() -> Result<(), ConfigError> {
        let block = Manifest::parse(
            "requirements: |\n  numpy==1.24.1\n  # comment\n  shapely\n",
            "//demo",
        )?;
        assert_eq!(block.requirements, vec!["numpy==1.24.1", "shapely"]);

        let list = Manifest::parse("requirements:\n  - numpy==1.24.1\n", "//demo")?;
        assert_eq!(list.requirements, vec!["numpy==1.24.1"]);
        Ok(())
    }
}
