mod key;

pub use key::{collect_file_dependencies, CacheKey};

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::task::JoinSet;
use tracing::warn;

use fab_domain::{CacheError, EngineConfig};

/// Blobs of exactly this size are boolean test-result sentinels and are
/// always admitted regardless of the minimum entry size.
const SENTINEL_LEN: usize = 1;

/// The per-entry meta blob recording the human-readable key name.
const NAME_BLOB: &str = "name";

/// Content-addressable key→blob store on local disk.
///
/// Each entry is a set of named byte blobs stored as
/// `<state>/cache/<data_type>/<digest>.<blob>`. Writes and reads for one
/// entry run as independent I/O tasks joined before returning. All I/O
/// failures degrade to a cache miss; nothing here ever fails the caller.
pub struct BlobCache {
    dir: PathBuf,
    enabled: bool,
    min_entry_size: usize,
    max_entry_size: usize,
}

impl BlobCache {
    #[must_use]
    pub fn new(config: &EngineConfig, data_type: &str) -> Self {
        let dir = config.state_dir.join("cache").join(data_type);
        if config.cache {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!("failed to create cache dir {}: {err}", dir.display());
            }
        }
        Self {
            dir,
            enabled: config.cache,
            min_entry_size: usize::try_from(config.cache_min_entry_size).unwrap_or(usize::MAX),
            max_entry_size: usize::try_from(config.cache_max_entry_size).unwrap_or(usize::MAX),
        }
    }

    fn blob_path(&self, key: &CacheKey, blob: &str) -> PathBuf {
        self.dir.join(format!("{}.{blob}", key.digest()))
    }

    fn admits(&self, len: usize) -> bool {
        if len == SENTINEL_LEN {
            return true;
        }
        len >= self.min_entry_size && len <= self.max_entry_size
    }

    #[must_use]
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.enabled && self.blob_path(key, NAME_BLOB).is_file()
    }

    /// Writes the named blobs for `key`.
    ///
    /// Blobs outside the admission window are skipped but still reported
    /// as complete; the returned flag is false only when an eligible blob
    /// failed to persist. Disabled caches are a no-op.
    pub async fn write(
        &self,
        key: &CacheKey,
        items: HashMap<String, Vec<u8>>,
    ) -> HashMap<String, bool> {
        if !self.enabled {
            return HashMap::new();
        }

        let mut saved = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut wrote_any = false;
        for (blob, data) in items {
            if !self.admits(data.len()) {
                saved.insert(blob, true);
                continue;
            }
            wrote_any = true;
            tasks.spawn(write_blob(self.blob_path(key, &blob), blob, data));
        }
        if wrote_any {
            tasks.spawn(write_blob(
                self.blob_path(key, NAME_BLOB),
                NAME_BLOB.to_string(),
                key.name().as_bytes().to_vec(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((blob, ok)) => {
                    if blob != NAME_BLOB {
                        saved.insert(blob, ok);
                    }
                }
                Err(err) => warn!("cache write task failed: {err}"),
            }
        }
        saved
    }

    /// Reads the named blobs for `key`; missing blobs come back as `None`.
    pub async fn read(&self, key: &CacheKey, blobs: &[&str]) -> HashMap<String, Option<Vec<u8>>> {
        let mut results: HashMap<String, Option<Vec<u8>>> =
            blobs.iter().map(|blob| ((*blob).to_string(), None)).collect();
        if !self.enabled {
            return results;
        }

        let mut tasks = JoinSet::new();
        for blob in blobs {
            let path = self.blob_path(key, blob);
            let blob = (*blob).to_string();
            tasks.spawn(async move {
                let data = tokio::fs::read(&path).await.ok();
                (blob, data)
            });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((blob, data)) => {
                    results.insert(blob, data);
                }
                Err(err) => warn!("cache read task failed: {err}"),
            }
        }
        results
    }
}

/// One blob write: staged to a temporary file, then renamed into place so
/// concurrent readers never observe a partial blob.
async fn write_blob(path: PathBuf, blob: String, data: Vec<u8>) -> (String, bool) {
    match try_write(&path, &data).await {
        Ok(()) => (blob, true),
        Err(err) => {
            warn!("{err}; {} degrades to a miss", path.display());
            (blob, false)
        }
    }
}

async fn try_write(path: &PathBuf, data: &[u8]) -> Result<(), CacheError> {
    let mut staging = path.clone().into_os_string();
    staging.push(format!(".tmp{}", std::process::id()));
    let staging = PathBuf::from(staging);
    let result = async {
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, path).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&staging).await;
    }
    result.map_err(|err| CacheError::Io(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            state_dir: dir.to_path_buf(),
            cache_min_entry_size: 4,
            cache_max_entry_size: 64,
            ..EngineConfig::default()
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, &serde_yaml::Mapping::new(), &[]).unwrap()
    }

    #[tokio::test]
    async fn round_trips_blobs() -> Result<()> {
        let dir = tempdir()?;
        let cache = BlobCache::new(&test_config(dir.path()), "shapes");
        let key = key("cube");

        let mut items = HashMap::new();
        items.insert("geometry".to_string(), b"solid cube".to_vec());
        items.insert("meta".to_string(), b"12 faces".to_vec());
        let saved = cache.write(&key, items).await;
        assert_eq!(saved.get("geometry"), Some(&true));
        assert_eq!(saved.get("meta"), Some(&true));
        assert!(cache.exists(&key));

        let read = cache.read(&key, &["geometry", "meta", "absent"]).await;
        assert_eq!(read["geometry"].as_deref(), Some(b"solid cube".as_ref()));
        assert_eq!(read["meta"].as_deref(), Some(b"12 faces".as_ref()));
        assert_eq!(read["absent"], None);
        Ok(())
    }

    #[tokio::test]
    async fn persists_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let key = key("cube");
        {
            let cache = BlobCache::new(&test_config(dir.path()), "shapes");
            let mut items = HashMap::new();
            items.insert("geometry".to_string(), b"solid cube".to_vec());
            cache.write(&key, items).await;
        }
        let cache = BlobCache::new(&test_config(dir.path()), "shapes");
        let read = cache.read(&key, &["geometry"]).await;
        assert_eq!(read["geometry"].as_deref(), Some(b"solid cube".as_ref()));
        Ok(())
    }

    #[tokio::test]
    async fn size_window_filters_blobs_but_reports_completion() -> Result<()> {
        let dir = tempdir()?;
        let cache = BlobCache::new(&test_config(dir.path()), "shapes");
        let key = key("cube");

        let mut items = HashMap::new();
        items.insert("tiny".to_string(), b"ab".to_vec());
        items.insert("huge".to_string(), vec![0u8; 1000]);
        items.insert("fits".to_string(), b"just right".to_vec());
        let saved = cache.write(&key, items).await;
        assert_eq!(saved.get("tiny"), Some(&true));
        assert_eq!(saved.get("huge"), Some(&true));
        assert_eq!(saved.get("fits"), Some(&true));

        let read = cache.read(&key, &["tiny", "huge", "fits"]).await;
        assert_eq!(read["tiny"], None);
        assert_eq!(read["huge"], None);
        assert!(read["fits"].is_some());
        Ok(())
    }

    #[tokio::test]
    async fn one_byte_sentinels_bypass_the_minimum() -> Result<()> {
        let dir = tempdir()?;
        let cache = BlobCache::new(&test_config(dir.path()), "tests");
        let key = key("test-result");

        let mut items = HashMap::new();
        items.insert("passed".to_string(), b"1".to_vec());
        cache.write(&key, items).await;

        let read = cache.read(&key, &["passed"]).await;
        assert_eq!(read["passed"].as_deref(), Some(b"1".as_ref()));
        Ok(())
    }

    #[tokio::test]
    async fn disabled_cache_is_a_no_op() -> Result<()> {
        let dir = tempdir()?;
        let config = EngineConfig {
            cache: false,
            ..test_config(dir.path())
        };
        let cache = BlobCache::new(&config, "shapes");
        let key = key("cube");

        let mut items = HashMap::new();
        items.insert("geometry".to_string(), b"solid cube".to_vec());
        let saved = cache.write(&key, items).await;
        assert!(saved.is_empty());
        assert!(!cache.exists(&key));
        assert_eq!(cache.read(&key, &["geometry"]).await["geometry"], None);
        Ok(())
    }
}
