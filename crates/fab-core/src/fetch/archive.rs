use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::{debug, info};

use fab_domain::{EngineConfig, FetchError, ImportDescriptor};

use crate::fetch::git::guard_is_stale;
use crate::fetch::{DigestLocks, FetchStats};

const GUARD_FILE: &str = ".fab.archive.fetched";

/// Materializes archive-backed imports: download, extract into a
/// digest-named cache directory, guard-file freshness like the git
/// fetcher but with no revision tracking.
pub struct ArchiveFetcher {
    cache_dir: PathBuf,
    locks: DigestLocks,
    force_update: bool,
    offline: bool,
    stats: Arc<FetchStats>,
}

impl ArchiveFetcher {
    #[must_use]
    pub fn new(config: &EngineConfig, stats: Arc<FetchStats>) -> Self {
        Self {
            cache_dir: config.state_dir.join("archive"),
            locks: DigestLocks::default(),
            force_update: config.force_update,
            offline: config.offline,
            stats,
        }
    }

    /// # Errors
    ///
    /// Returns a `FetchError` when the archive cannot be downloaded or
    /// extracted and no fresh cached copy exists.
    pub fn fetch(&self, descriptor: &ImportDescriptor) -> Result<PathBuf, FetchError> {
        let url = &descriptor.location;
        let dir_name = hex::encode(Sha256::digest(url.as_bytes()));
        let path = self.cache_dir.join(&dir_name);
        let guard_path = path.join(GUARD_FILE);

        let lock = self.locks.get(&dir_name);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let cached = guard_path.is_file();
        if cached && !self.force_update && !guard_is_stale(&guard_path) {
            debug!("archive cache hit for {url}");
            return Ok(rooted(path, descriptor));
        }
        if self.offline {
            if cached {
                return Ok(rooted(path, descriptor));
            }
            return Err(FetchError::Offline(url.clone()));
        }

        info!("downloading the archive: {url}");
        self.stats.record_download();
        let bytes = download(url)?;

        // Re-extract from scratch so removals upstream are reflected.
        if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(|err| FetchError::Failed(format!("failed to clear {}: {err}", path.display())))?;
        }
        fs::create_dir_all(&path)
            .map_err(|err| FetchError::Failed(format!("failed to create {}: {err}", path.display())))?;
        extract(url, &bytes, &path)?;
        fs::write(&guard_path, url)
            .map_err(|err| FetchError::Failed(format!("failed to write {}: {err}", guard_path.display())))?;

        Ok(rooted(path, descriptor))
    }
}

fn rooted(path: PathBuf, descriptor: &ImportDescriptor) -> PathBuf {
    match &descriptor.subpath {
        Some(subpath) => path.join(subpath),
        None => path,
    }
}

fn download(url: &str) -> Result<Vec<u8>, FetchError> {
    let response = reqwest::blocking::get(url).map_err(classify_http)?;
    if !response.status().is_success() {
        return Err(FetchError::Failed(format!(
            "{url} returned HTTP {}",
            response.status()
        )));
    }
    let bytes = response.bytes().map_err(classify_http)?;
    Ok(bytes.to_vec())
}

fn classify_http(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Failed(err.to_string())
    }
}

fn extract(url: &str, bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    if url.ends_with(".zip") {
        extract_zip(bytes, dest)
    } else {
        extract_tar_gz(bytes, dest)
    }
}

/// Unpacks a gzip-compressed tree, stripping the single top-level
/// directory most release tarballs carry.
pub(crate) fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let decoder = GzDecoder::new(BufReader::new(bytes));
    let mut archive = Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|err| FetchError::Failed(format!("unreadable archive: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| FetchError::Failed(format!("unreadable archive entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| FetchError::Failed(format!("bad archive path: {err}")))?;
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| FetchError::Failed(format!("failed to create {}: {err}", parent.display())))?;
        }
        entry
            .unpack(&target)
            .map_err(|err| FetchError::Failed(format!("failed to unpack {}: {err}", target.display())))?;
    }
    Ok(())
}

pub(crate) fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|err| FetchError::Failed(format!("unreadable zip: {err}")))?;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|err| FetchError::Failed(format!("unreadable zip entry: {err}")))?;
        let Some(path) = file.enclosed_name() else {
            return Err(FetchError::Failed("zip entry escapes the archive".to_string()));
        };
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&stripped);
        if file.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| FetchError::Failed(format!("failed to create {}: {err}", target.display())))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| FetchError::Failed(format!("failed to create {}: {err}", parent.display())))?;
        }
        let mut out = File::create(&target)
            .map_err(|err| FetchError::Failed(format!("failed to create {}: {err}", target.display())))?;
        std::io::copy(&mut file, &mut out)
            .map_err(|err| FetchError::Failed(format!("failed to unpack {}: {err}", target.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn tar_gz_extraction_strips_the_top_level_dir() -> Result<()> {
        let dir = tempdir()?;
        let bytes = build_tar_gz(&[
            ("pkg-1.0/fab.yaml", "desc: archived\n"),
            ("pkg-1.0/parts/cube.scad", "cube(1);"),
        ]);
        extract_tar_gz(&bytes, dir.path())?;
        assert_eq!(
            fs::read_to_string(dir.path().join("fab.yaml"))?,
            "desc: archived\n"
        );
        assert!(dir.path().join("parts/cube.scad").is_file());
        Ok(())
    }

    #[test]
    fn zip_extraction_strips_the_top_level_dir() -> Result<()> {
        let dir = tempdir()?;
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::FileOptions::default();
            writer.start_file("pkg-1.0/fab.yaml", options)?;
            writer.write_all(b"desc: zipped\n")?;
            writer.finish()?;
        }
        extract_zip(buffer.get_ref(), dir.path())?;
        assert_eq!(
            fs::read_to_string(dir.path().join("fab.yaml"))?,
            "desc: zipped\n"
        );
        Ok(())
    }
}
