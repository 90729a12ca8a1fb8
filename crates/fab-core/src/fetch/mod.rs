pub mod archive;
pub mod git;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use fab_domain::{EngineConfig, ImportDescriptor, ImportKind};

use crate::effects::GitClient;

/// Counters for network-touching fetch operations, used by tests and
/// status reporting.
#[derive(Debug, Default)]
pub struct FetchStats {
    git_ops: AtomicU64,
    downloads: AtomicU64,
}

impl FetchStats {
    pub(crate) fn record_git_op(&self) {
        self.git_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn git_ops(&self) -> u64 {
        self.git_ops.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Every operation that touched the network.
    #[must_use]
    pub fn network_ops(&self) -> u64 {
        self.git_ops() + self.downloads()
    }
}

/// Per-digest mutexes guarding remote cache directories.
///
/// Distinct from the resolver's per-package locks: the same remote URL may
/// back multiple packages.
#[derive(Default)]
pub(crate) struct DigestLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DigestLocks {
    pub(crate) fn get(&self, digest: &str) -> Arc<Mutex<()>> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Dispatches an import to the fetcher matching its kind.
///
/// All fetchers are idempotent and safe to call repeatedly; they block and
/// are expected to run on the worker bridge.
pub struct Fetchers {
    git: git::GitFetcher,
    archive: archive::ArchiveFetcher,
    stats: Arc<FetchStats>,
}

impl Fetchers {
    #[must_use]
    pub fn new(config: &EngineConfig, git_client: Arc<dyn GitClient>) -> Self {
        let stats = Arc::new(FetchStats::default());
        Self {
            git: git::GitFetcher::new(config, git_client, stats.clone()),
            archive: archive::ArchiveFetcher::new(config, stats.clone()),
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<FetchStats> {
        &self.stats
    }

    /// Materializes the import's files and returns the package root.
    ///
    /// # Errors
    ///
    /// Returns a `FetchError` (wrapped) when the files cannot be
    /// materialized; the error aborts only the affected graph branch.
    pub fn fetch(&self, parent_dir: &Path, descriptor: &ImportDescriptor) -> Result<PathBuf> {
        match descriptor.kind {
            ImportKind::Local => Ok(resolve_local(parent_dir, &descriptor.location)),
            ImportKind::Git => Ok(self.git.fetch(descriptor)?),
            ImportKind::Archive => Ok(self.archive.fetch(descriptor)?),
        }
    }
}

/// Local imports resolve relative to the parent package's directory.
fn resolve_local(parent_dir: &Path, location: &str) -> PathBuf {
    let path = Path::new(location);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        parent_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_paths_resolve_against_the_parent() {
        let root = resolve_local(Path::new("/work/root"), "sub/inner");
        assert_eq!(root, Path::new("/work/root/sub/inner"));

        let absolute = resolve_local(Path::new("/work/root"), "/elsewhere/pkg");
        assert_eq!(absolute, Path::new("/elsewhere/pkg"));
    }

    #[test]
    fn digest_locks_hand_out_one_mutex_per_digest() {
        let locks = DigestLocks::default();
        let a = locks.get("abc");
        let b = locks.get("abc");
        let c = locks.get("def");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
