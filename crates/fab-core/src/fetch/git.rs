use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fab_domain::{EngineConfig, FetchError, GitRetryConfig, ImportDescriptor};

use crate::effects::GitClient;
use crate::fetch::{DigestLocks, FetchStats};

/// Marker recording the last successful clone/update of a cache directory.
/// For pinned imports its content is the checked-out revision.
const GUARD_FILE: &str = ".fab.git.cloned";

/// How long a cached repository stays fresh without re-checking the remote.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Error signatures that identify a transient network failure worth
/// retrying. Anything else aborts immediately.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "RPC failed",
    "Could not resolve host",
    "bytes of body are still expected",
    "Operation timed out after",
    "SSL certificate problem",
    "Send failure: Broken pipe",
    "remote did not send all necessary objects",
    "from proxy after CONNECT",
    "unexpected disconnect while reading sideband packet",
    "early EOF",
    "fetch-pack: invalid index-pack output",
];

/// Classifies a git failure by matching its output against the transient
/// signature table.
#[must_use]
pub fn classify_failure(text: &str) -> FetchError {
    let summary = text.trim().to_string();
    if TRANSIENT_SIGNATURES.iter().any(|sig| text.contains(sig)) {
        FetchError::Transient(summary)
    } else {
        FetchError::Failed(summary)
    }
}

/// Materializes git-backed imports into digest-named cache directories.
pub struct GitFetcher {
    cache_dir: PathBuf,
    locks: DigestLocks,
    retry: GitRetryConfig,
    force_update: bool,
    offline: bool,
    client: Arc<dyn GitClient>,
    stats: Arc<FetchStats>,
}

impl GitFetcher {
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        client: Arc<dyn GitClient>,
        stats: Arc<FetchStats>,
    ) -> Self {
        Self {
            cache_dir: config.state_dir.join("git"),
            locks: DigestLocks::default(),
            retry: config.git_retry,
            force_update: config.force_update,
            offline: config.offline,
            client,
            stats,
        }
    }

    /// Clones or refreshes the repository cache and returns the package
    /// root inside it.
    ///
    /// # Errors
    ///
    /// Transient failures are retried up to the configured maximum with a
    /// fixed delay; other failures abort immediately. After exhausting
    /// retries an existing cached copy is used as a fallback before the
    /// error is raised.
    pub fn fetch(&self, descriptor: &ImportDescriptor) -> Result<PathBuf, FetchError> {
        let dir_name = cache_dir_name(&descriptor.location, descriptor.revision.as_deref());
        let path = self.cache_dir.join(&dir_name);
        let guard_path = path.join(GUARD_FILE);

        let lock = self.locks.get(&dir_name);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut attempt: u32 = 0;
        loop {
            let result = if path.exists() {
                self.update(&path, &guard_path, descriptor)
            } else {
                self.clone_into(&path, &guard_path, descriptor)
            };
            match result {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < self.retry.max => {
                    warn!(
                        "failed to fetch {}: {err}; retrying ({}/{}) in {:?}",
                        descriptor.location,
                        attempt + 1,
                        self.retry.max,
                        self.retry.patience,
                    );
                    thread::sleep(self.retry.patience);
                    attempt += 1;
                }
                Err(err) => {
                    if guard_path.is_file() {
                        // A previous successful fetch is better than nothing.
                        warn!(
                            "failed to update {}: {err}; using the previous cached copy",
                            descriptor.location
                        );
                        break;
                    }
                    return Err(err);
                }
            }
        }

        let mut root = path;
        if let Some(subpath) = &descriptor.subpath {
            root = root.join(subpath);
        }
        Ok(root)
    }

    fn clone_into(
        &self,
        path: &Path,
        guard_path: &Path,
        descriptor: &ImportDescriptor,
    ) -> Result<(), FetchError> {
        if self.offline {
            return Err(FetchError::Offline(descriptor.location.clone()));
        }
        info!("cloning the git repo: {}", descriptor.location);
        self.stats.record_git_op();
        if let Err(err) = self.client.clone_repo(&descriptor.location, path) {
            // A half-cloned tree must not be mistaken for a cache hit.
            let _ = fs::remove_dir_all(path);
            return Err(err);
        }
        let recorded = match &descriptor.revision {
            Some(revision) => {
                self.client.checkout(path, revision)?;
                revision.clone()
            }
            None => self.client.head_commit(path)?,
        };
        write_guard(guard_path, &recorded)
    }

    fn update(
        &self,
        path: &Path,
        guard_path: &Path,
        descriptor: &ImportDescriptor,
    ) -> Result<(), FetchError> {
        if self.offline {
            debug!("offline: using the cached copy of {}", descriptor.location);
            return Ok(());
        }
        match &descriptor.revision {
            None => {
                if self.force_update || guard_is_stale(guard_path) {
                    debug!("refreshing the default branch of {}", descriptor.location);
                    self.stats.record_git_op();
                    self.client.pull_default_branch(path)?;
                    let head = self.client.head_commit(path)?;
                    write_guard(guard_path, &head)?;
                }
            }
            Some(revision) => {
                let recorded = fs::read_to_string(guard_path).ok();
                if self.force_update
                    || recorded.as_deref() != Some(revision.as_str())
                    || guard_is_stale(guard_path)
                {
                    debug!("checking out {revision} of {}", descriptor.location);
                    self.stats.record_git_op();
                    self.client.fetch_origin(path)?;
                    self.client.checkout(path, revision)?;
                    write_guard(guard_path, revision)?;
                }
            }
        }
        Ok(())
    }
}

fn write_guard(path: &Path, contents: &str) -> Result<(), FetchError> {
    fs::write(path, contents).map_err(|err| {
        FetchError::Failed(format!("failed to write {}: {err}", path.display()))
    })
}

pub(crate) fn guard_is_stale(path: &Path) -> bool {
    let age = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    age.is_none_or(|age| age > FRESHNESS_WINDOW)
}

/// Cache directory name: a digest of the URL with the revision appended in
/// readable form, so multiple revisions of one repo sit side by side.
fn cache_dir_name(url: &str, revision: Option<&str>) -> String {
    let mut name = hex::encode(Sha256::digest(url.as_bytes()));
    if let Some(revision) = revision {
        name.push('-');
        name.push_str(&revision.replace('/', "-slash-").replace('\\', "-sep-"));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use fab_domain::PackagePath;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    struct FlakyGit {
        attempts: AtomicU64,
        fail_with: fn() -> FetchError,
        succeed_after: u64,
    }

    impl FlakyGit {
        fn always_transient() -> Self {
            Self {
                attempts: AtomicU64::new(0),
                fail_with: || FetchError::Transient("early EOF".to_string()),
                succeed_after: u64::MAX,
            }
        }

        fn hard_failure() -> Self {
            Self {
                attempts: AtomicU64::new(0),
                fail_with: || FetchError::Failed("repository not found".to_string()),
                succeed_after: u64::MAX,
            }
        }
    }

    impl GitClient for FlakyGit {
        fn clone_repo(&self, _url: &str, dest: &Path) -> Result<(), FetchError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.succeed_after {
                return Err((self.fail_with)());
            }
            fs::create_dir_all(dest)
                .map_err(|err| FetchError::Failed(err.to_string()))
        }

        fn fetch_origin(&self, _repo: &Path) -> Result<(), FetchError> {
            Ok(())
        }

        fn checkout(&self, _repo: &Path, _revision: &str) -> Result<(), FetchError> {
            Ok(())
        }

        fn pull_default_branch(&self, _repo: &Path) -> Result<(), FetchError> {
            Ok(())
        }

        fn head_commit(&self, _repo: &Path) -> Result<String, FetchError> {
            Ok("deadbeef".to_string())
        }
    }

    fn descriptor(url: &str, revision: Option<&str>) -> ImportDescriptor {
        ImportDescriptor {
            name: PackagePath::root().child("ext"),
            kind: fab_domain::ImportKind::Git,
            location: url.to_string(),
            revision: revision.map(ToString::to_string),
            subpath: None,
            inherited: serde_yaml::Mapping::new(),
        }
    }

    fn fetcher_with(client: Arc<dyn GitClient>, state: &Path, max_retries: u32) -> GitFetcher {
        let config = EngineConfig {
            state_dir: state.to_path_buf(),
            git_retry: GitRetryConfig {
                max: max_retries,
                patience: Duration::from_millis(1),
            },
            ..EngineConfig::default()
        };
        GitFetcher::new(&config, client, Arc::new(FetchStats::default()))
    }

    #[test]
    fn classifies_transient_signatures() {
        assert!(classify_failure("fatal: early EOF").is_transient());
        assert!(classify_failure(
            "fatal: unable to access 'https://example.com/r.git': Could not resolve host: example.com"
        )
        .is_transient());
        assert!(!classify_failure("fatal: repository 'x' does not exist").is_transient());
    }

    #[test]
    fn transient_failures_retry_exactly_max_plus_one_times() -> Result<()> {
        let dir = tempdir()?;
        let git = Arc::new(FlakyGit::always_transient());
        let fetcher = fetcher_with(git.clone(), dir.path(), 3);

        let result = fetcher.fetch(&descriptor("https://example.com/ext.git", None));
        assert!(result.is_err());
        assert_eq!(git.attempts.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[test]
    fn hard_failures_abort_without_retrying() -> Result<()> {
        let dir = tempdir()?;
        let git = Arc::new(FlakyGit::hard_failure());
        let fetcher = fetcher_with(git.clone(), dir.path(), 3);

        let result = fetcher.fetch(&descriptor("https://example.com/ext.git", None));
        assert!(result.is_err());
        assert_eq!(git.attempts.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn fresh_cache_skips_the_network() -> Result<()> {
        let dir = tempdir()?;
        let git = Arc::new(FlakyGit {
            attempts: AtomicU64::new(0),
            fail_with: || FetchError::Failed("unreachable".to_string()),
            succeed_after: 0,
        });
        let fetcher = fetcher_with(git.clone(), dir.path(), 0);
        let descriptor = descriptor("https://example.com/ext.git", None);

        let first = fetcher.fetch(&descriptor)?;
        assert_eq!(git.attempts.load(Ordering::SeqCst), 1);

        // The guard file is fresh, so a second fetch is pure cache.
        let second = fetcher.fetch(&descriptor)?;
        assert_eq!(first, second);
        assert_eq!(git.attempts.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn update_failure_falls_back_to_the_cached_copy() -> Result<()> {
        let dir = tempdir()?;
        let git = Arc::new(FlakyGit {
            attempts: AtomicU64::new(0),
            fail_with: || FetchError::Failed("unreachable".to_string()),
            succeed_after: 0,
        });
        let fetcher = fetcher_with(git.clone(), dir.path(), 0);
        let pinned = descriptor("https://example.com/ext.git", Some("v1"));
        let root = fetcher.fetch(&pinned)?;

        // A different pinned revision forces an update pass against a dead
        // remote; the previous copy must win.
        struct DeadGit;
        impl GitClient for DeadGit {
            fn clone_repo(&self, _url: &str, _dest: &Path) -> Result<(), FetchError> {
                Err(FetchError::Failed("unreachable".to_string()))
            }
            fn fetch_origin(&self, _repo: &Path) -> Result<(), FetchError> {
                Err(FetchError::Failed("unreachable".to_string()))
            }
            fn checkout(&self, _repo: &Path, _revision: &str) -> Result<(), FetchError> {
                Err(FetchError::Failed("unreachable".to_string()))
            }
            fn pull_default_branch(&self, _repo: &Path) -> Result<(), FetchError> {
                Err(FetchError::Failed("unreachable".to_string()))
            }
            fn head_commit(&self, _repo: &Path) -> Result<String, FetchError> {
                Err(FetchError::Failed("unreachable".to_string()))
            }
        }

        let config = EngineConfig {
            state_dir: dir.path().to_path_buf(),
            force_update: true,
            ..EngineConfig::default()
        };
        let dead = GitFetcher::new(&config, Arc::new(DeadGit), Arc::new(FetchStats::default()));
        let fallback = dead.fetch(&pinned)?;
        assert_eq!(root, fallback);
        Ok(())
    }

    #[test]
    fn revision_lands_in_the_cache_dir_name() {
        let plain = cache_dir_name("https://example.com/ext.git", None);
        let pinned = cache_dir_name("https://example.com/ext.git", Some("feature/x"));
        assert!(pinned.starts_with(&plain));
        assert!(pinned.ends_with("-feature-slash-x"));
    }

    #[test]
    fn offline_mode_uses_the_cache_or_fails() -> Result<()> {
        let dir = tempdir()?;
        let config = EngineConfig {
            state_dir: dir.path().to_path_buf(),
            offline: true,
            ..EngineConfig::default()
        };
        let fetcher = GitFetcher::new(
            &config,
            Arc::new(FlakyGit::hard_failure()),
            Arc::new(FetchStats::default()),
        );
        let result = fetcher.fetch(&descriptor("https://example.com/ext.git", None));
        assert!(matches!(result, Err(FetchError::Offline(_))));
        Ok(())
    }
}
