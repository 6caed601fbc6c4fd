//! Freshness cache: an on-disk key/value store with TTL expiry.
//!
//! Every entry lives in its own JSON file under the cache directory, named by
//! the SHA-256 of its key (see [`record`]). Writes go to a temporary file that
//! is renamed over the record, so a concurrent reader sees either the previous
//! record or the new one in full.
//!
//! Expiry is lazy: an expired record is deleted by the [`FileCache::get`] that
//! finds it. There is no background sweep.
//!
//! All filesystem access goes through [`tokio::fs`], which runs the blocking
//! calls on the runtime's blocking pool instead of the network workers.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

mod record;

use record::{CacheRecord, RECORD_EXTENSION, storage_name};

/// Errors produced by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed cache record at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cache record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// A directory-backed cache of byte payloads with per-entry expiry.
///
/// Cloning is cheap and every clone addresses the same directory. Operations on
/// distinct keys touch distinct files and never contend.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use ttlproxy::cache::FileCache;
///
/// # async fn demo() -> Result<(), ttlproxy::cache::CacheError> {
/// let cache = FileCache::open("./cache").await?;
/// cache.set("GET:https://example.com/", b"{}", Duration::from_secs(60)).await?;
/// assert_eq!(cache.get("GET:https://example.com/").await?.as_deref(), Some(&b"{}"[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Creates a handle for `dir` without touching the filesystem.
    ///
    /// Call [`ensure_store`](Self::ensure_store) (or use [`open`](Self::open))
    /// before the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates a handle for `dir`, makes sure the directory exists and that
    /// records can be written into it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created or is not
    /// writable.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = Self::new(dir);
        cache.ensure_store().await?;
        cache.check_writable().await?;
        Ok(cache)
    }

    /// Returns the backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the backing directory (and its parents) if absent.
    ///
    /// Succeeds if the directory already exists.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] for any other creation failure.
    pub async fn ensure_store(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))
    }

    // An existing read-only directory passes `create_dir_all`; only a real
    // write tells.
    async fn check_writable(&self) -> Result<(), CacheError> {
        let marker = self.dir.join(format!(".writable.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&marker, b"")
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;
        remove_if_present(&marker).await
    }

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the record cannot be written or moved into
    /// place. A failed write never leaves a partial record behind.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let record = CacheRecord::new(key, Bytes::copy_from_slice(value), Utc::now(), ttl);
        let encoded = serde_json::to_vec(&record)?;

        let path = self.record_path(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            storage_name(key),
            Uuid::new_v4().simple()
        ));

        fs::write(&tmp, &encoded)
            .await
            .map_err(|e| CacheError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::io(&path, e));
        }

        debug!(key, path = %path.display(), bytes = value.len(), "cache record written");
        Ok(())
    }

    /// Returns the value stored under `key` if it has not expired.
    ///
    /// An expired record is deleted before `None` is returned. A record whose
    /// embedded key differs from `key` is treated as absent.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Io`]: the record exists but cannot be read, or an
    ///   expired record cannot be removed.
    /// - [`CacheError::Malformed`]: the record cannot be parsed. It is left in
    ///   place; the next [`set`](Self::set) for the key overwrites it.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let path = self.record_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let record: CacheRecord = serde_json::from_slice(&raw)
            .map_err(|source| CacheError::Malformed {
                path: path.clone(),
                source,
            })?;

        if record.key != key {
            debug!(key, stored = %record.key, "cache record belongs to another key");
            return Ok(None);
        }

        if !record.is_fresh(Utc::now()) {
            debug!(key, "cache record expired, evicting");
            remove_if_present(&path).await?;
            return Ok(None);
        }

        Ok(Some(record.value))
    }

    /// Removes the entry for `key`. Removing an absent entry is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if an existing record cannot be removed.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        remove_if_present(&self.record_path(key)).await
    }

    /// Removes every record in the store and returns how many were removed.
    ///
    /// The directory itself, and any file that is not a record, is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be listed or a record
    /// cannot be removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }

        debug!(dir = %self.dir.display(), removed, "cache cleared");
        Ok(removed)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", storage_name(key)))
    }
}

async fn remove_if_present(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

// Temporary files start with '.', so only finished records match.
fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
}
