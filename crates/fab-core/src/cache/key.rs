use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Deterministic fingerprint of a build object.
///
/// Derived from the object's normalized configuration and the content
/// digests of its transitive file dependencies, so any change to either
/// produces a different key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    digest: String,
}

impl CacheKey {
    /// # Errors
    ///
    /// Returns an error when a file dependency cannot be read; callers
    /// treat that as a cache miss.
    pub fn new(name: &str, config: &serde_yaml::Mapping, files: &[PathBuf]) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(canonical_config(config)?.as_bytes());
        for file in files {
            let contents = fs::read(file)
                .with_context(|| format!("reading cache dependency {}", file.display()))?;
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update(Sha256::digest(&contents));
        }
        Ok(Self {
            name: name.to_string(),
            digest: hex::encode(hasher.finalize()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Normalized JSON rendering of a configuration: mapping keys sorted
/// recursively so semantically equal configs hash identically.
fn canonical_config(config: &serde_yaml::Mapping) -> Result<String> {
    let value = serde_json::to_value(config).context("configuration is not serializable")?;
    let mut out = String::new();
    canonical_write(&value, &mut out);
    Ok(out)
}

fn canonical_write(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::from(key.as_str()).to_string());
                out.push(':');
                canonical_write(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                canonical_write(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Collects the file dependencies under `path`: the file itself, or every
/// file below a directory in a stable order.
#[must_use]
pub fn collect_file_dependencies(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}
