//! Cache storage trait and file-backed implementation.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::error::StoreError;
use super::traits::CacheMetadata;

const ARTIFACT_FILE: &str = "artifact.bin";
const METADATA_FILE: &str = "metadata.json";

/// Trait for cache storage backends.
///
/// A backend holds exactly one artifact and its metadata record. Writes must
/// be atomic: a reader sees either the previous value or the new one.
pub trait CacheStorage: Send + Sync {
  /// Read the persisted metadata. `Ok(None)` if nothing was ever saved.
  fn read_metadata(&self) -> Result<Option<CacheMetadata>, StoreError>;

  /// Persist the metadata record.
  fn save_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError>;

  /// Read the cached artifact. `Ok(None)` if no fetch ever succeeded.
  fn read_artifact(&self) -> Result<Option<Bytes>, StoreError>;

  /// Replace the cached artifact.
  fn write_artifact(&self, data: &[u8]) -> Result<(), StoreError>;

  /// Metadata for state evaluation. Never fails: a missing record and a
  /// corrupt one both yield the zero value, which forces a refresh.
  fn load_metadata(&self) -> CacheMetadata {
    match self.read_metadata() {
      Ok(Some(metadata)) => metadata,
      Ok(None) => CacheMetadata::default(),
      Err(e) => {
        tracing::warn!(error = %e, "discarding unreadable cache metadata");
        CacheMetadata::default()
      }
    }
  }
}

/// File-based storage: one payload file and one JSON metadata record under
/// a fixed data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
  dir: PathBuf,
}

impl FileStorage {
  /// Open storage rooted at `dir`, creating the directory if needed.
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;

    Ok(Self { dir })
  }

  pub fn artifact_path(&self) -> PathBuf {
    self.dir.join(ARTIFACT_FILE)
  }

  pub fn metadata_path(&self) -> PathBuf {
    self.dir.join(METADATA_FILE)
  }
}

impl CacheStorage for FileStorage {
  fn read_metadata(&self) -> Result<Option<CacheMetadata>, StoreError> {
    let raw = match fs::read(self.metadata_path()) {
      Ok(raw) => raw,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(StoreError::MetadataCorrupt(e.to_string())),
    };

    serde_json::from_slice(&raw)
      .map(Some)
      .map_err(|e| StoreError::MetadataCorrupt(e.to_string()))
  }

  fn save_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
    let data = serde_json::to_vec(metadata)
      .map_err(|e| StoreError::MetadataWriteFailed(io::Error::other(e)))?;

    write_atomic(&self.metadata_path(), &data).map_err(StoreError::MetadataWriteFailed)
  }

  fn read_artifact(&self) -> Result<Option<Bytes>, StoreError> {
    match fs::read(self.artifact_path()) {
      Ok(data) => Ok(Some(Bytes::from(data))),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(StoreError::StorageUnavailable(e)),
    }
  }

  fn write_artifact(&self, data: &[u8]) -> Result<(), StoreError> {
    write_atomic(&self.artifact_path(), data).map_err(StoreError::StorageUnavailable)
  }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
  fs::create_dir_all(parent)?;

  let name = path
    .file_name()
    .and_then(|s| s.to_str())
    .unwrap_or("cache");
  let tmp = parent.join(format!(".{}.tmp.{}", name, std::process::id()));

  let result = (|| {
    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
  })();

  if result.is_err() {
    let _ = fs::remove_file(&tmp);
    return result;
  }

  // Persist the rename itself
  if let Ok(dir) = fs::File::open(parent) {
    let _ = dir.sync_all();
  }

  Ok(())
}

#[cfg(test)]
pub(crate) use memory::MemoryStorage;
