use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The canonical root package path.
pub const ROOT: &str = "//";

/// Canonical, slash-delimited identifier of a package.
///
/// A `PackagePath` is always rooted (`//...`) and never refers to a
/// filesystem location. Two equal paths denote the same resolved node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackagePath(String);

impl PackagePath {
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    /// Wraps an already-rooted path, normalizing trailing slashes.
    #[must_use]
    pub fn from_rooted(raw: &str) -> Self {
        let mut raw = raw.to_string();
        while raw.len() > 2 && raw.ends_with('/') {
            raw.pop();
        }
        debug_assert!(raw.starts_with(ROOT));
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// Appends one or more child segments.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut out = self.0.clone();
        for segment in name.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                if let Some(idx) = out.rfind('/') {
                    if idx >= 2 {
                        out.truncate(idx);
                    } else {
                        out.truncate(2);
                    }
                }
                continue;
            }
            if !out.ends_with('/') {
                out.push('/');
            }
            out.push_str(segment);
        }
        Self(out)
    }

    /// Resolves a user-supplied package reference against `current`.
    ///
    /// Empty strings and `"."` refer to the current package. A single `/`
    /// root prefix is accepted for backward compatibility and rewritten to
    /// `//` with a deprecation warning. Anything not starting with a slash
    /// resolves relative to `current`.
    #[must_use]
    pub fn resolve(current: &PackagePath, raw: &str) -> Self {
        let mut raw = raw.trim().to_string();
        while raw.len() > 1 && raw != ROOT && raw.ends_with('/') {
            raw.pop();
        }
        if raw.is_empty() || raw == "." {
            return current.clone();
        }
        if raw == "/" || raw == ROOT {
            return Self::root();
        }
        if raw.starts_with('/') && !raw.starts_with(ROOT) {
            warn!(
                "{raw}: using '/' as the root package path is deprecated, use '{ROOT}' instead"
            );
            raw.insert(0, '/');
        }
        if raw.starts_with(ROOT) {
            return Self::root().child(&raw[2..]);
        }
        current.child(&raw)
    }

    /// The path segments after the root prefix.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[2..].split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Splits an object reference of the form `"<package>:<object>"`.
///
/// A bare object name refers to the current package.
#[must_use]
pub fn split_object_spec(current: &PackagePath, spec: &str) -> (PackagePath, String) {
    match spec.rsplit_once(':') {
        Some((pkg, object)) => (PackagePath::resolve(current, pkg), object.to_string()),
        None => (current.clone(), spec.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_references() {
        let current = PackagePath::root().child("robots/arm");
        assert_eq!(PackagePath::resolve(&current, "").as_str(), "//robots/arm");
        assert_eq!(PackagePath::resolve(&current, ".").as_str(), "//robots/arm");
        assert_eq!(
            PackagePath::resolve(&current, "gripper").as_str(),
            "//robots/arm/gripper"
        );
        assert_eq!(
            PackagePath::resolve(&current, "../base").as_str(),
            "//robots/base"
        );
        assert_eq!(PackagePath::resolve(&current, "//").as_str(), "//");
        assert_eq!(
            PackagePath::resolve(&current, "//motors").as_str(),
            "//motors"
        );
    }

    #[test]
    fn rewrites_deprecated_single_slash_root() {
        let current = PackagePath::root();
        assert_eq!(
            PackagePath::resolve(&current, "/motors/nema17").as_str(),
            "//motors/nema17"
        );
    }

    #[test]
    fn strips_trailing_slashes() {
        let current = PackagePath::root();
        assert_eq!(
            PackagePath::resolve(&current, "//motors/").as_str(),
            "//motors"
        );
        assert_eq!(PackagePath::from_rooted("//a/b///").as_str(), "//a/b");
    }

    #[test]
    fn splits_object_specs() {
        let current = PackagePath::root().child("sub");
        let (pkg, object) = split_object_spec(&current, "//motors:nema17");
        assert_eq!(pkg.as_str(), "//motors");
        assert_eq!(object, "nema17");

        let (pkg, object) = split_object_spec(&current, "cube");
        assert_eq!(pkg.as_str(), "//sub");
        assert_eq!(object, "cube");
    }

    #[test]
    fn segments_walk_the_path() {
        let path = PackagePath::root().child("a/b/c");
        let segments: Vec<_> = path.segments().collect();
        assert_eq!(segments, vec!["a", "b", "c"]);
        assert_eq!(PackagePath::root().segments().count(), 0);
    }
}
