//! Content-addressed on-disk store for raw image responses.
//!
//! Each entry is a pair of files named after the [`ResourceKey`]:
//!
//! - `<key>.img`: the response body, byte for byte
//! - `<key>.meta.json`: a [`CacheEntryMetadata`] plus the body's length and
//!   SHA-256 digest
//!
//! Both files are written to a `tmp_*` name and renamed into place, payload
//! first. The digest binds the sidecar to its payload, so a crash between the
//! two renames leaves a pair that `read` rejects instead of serving bytes
//! under the wrong validators. Rejected pairs are deleted.
//!
//! Every operation on an entry holds that key's stripe lock, so a reader
//! never observes (or deletes) a pair halfway through a commit.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

use super::key::ResourceKey;
use super::metadata::CacheEntryMetadata;
use crate::Error;

const PAYLOAD_SUFFIX: &str = ".img";
const METADATA_SUFFIX: &str = ".meta.json";
const TEMP_PREFIX: &str = "tmp_";
const LOCK_STRIPES: usize = 64;

/// Sidecar file contents.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    metadata: CacheEntryMetadata,
    content_length: u64,
    body_sha256: String,
}

/// Persistent image store rooted at a single directory.
///
/// The store is the only writer of its directory. It does not lock across
/// processes.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    next_temp: AtomicU64,
    locks: Vec<Mutex<()>>,
}

impl DiskStore {
    /// Open (creating if needed) the store at `root`.
    ///
    /// Leftover temporary files from interrupted writes are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| Error::disk(&root, e))?;

        let locks = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        let store = Self { root, next_temp: AtomicU64::new(0), locks };
        store.remove_temp_files().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the payload for `key` lives (whether or not it exists yet).
    pub fn payload_path(&self, key: &ResourceKey) -> PathBuf {
        self.root.join(format!("{key}{PAYLOAD_SUFFIX}"))
    }

    fn metadata_path(&self, key: &ResourceKey) -> PathBuf {
        self.root.join(format!("{key}{METADATA_SUFFIX}"))
    }

    async fn lock(&self, key: &ResourceKey) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        self.locks[stripe].lock().await
    }

    fn temp_path(&self) -> PathBuf {
        let id = self.next_temp.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!("{TEMP_PREFIX}{}_{id}", std::process::id()))
    }

    /// Read a complete entry.
    ///
    /// Missing, partial or mismatched pairs are a miss; the latter two are
    /// deleted on the way out.
    pub async fn read(&self, key: &ResourceKey) -> Option<(Bytes, CacheEntryMetadata)> {
        let _guard = self.lock(key).await;
        let record = self.read_record(key).await?;

        let payload_path = self.payload_path(key);
        let bytes = match fs::read(&payload_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "cache payload missing for metadata, removing entry");
                self.discard(key).await;
                return None;
            }
        };

        if bytes.len() as u64 != record.content_length || sha256_hex(&bytes) != record.body_sha256 {
            tracing::warn!(key = %key, path = %payload_path.display(), "cache payload does not match metadata, removing entry");
            self.discard(key).await;
            return None;
        }

        Some((bytes, record.metadata))
    }

    /// Read only the metadata of an entry.
    pub async fn read_metadata(&self, key: &ResourceKey) -> Option<CacheEntryMetadata> {
        let _guard = self.lock(key).await;
        self.read_record(key).await.map(|record| record.metadata)
    }

    async fn read_record(&self, key: &ResourceKey) -> Option<SidecarRecord> {
        let path = self.metadata_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if fs::try_exists(self.payload_path(key)).await.unwrap_or(false) {
                    tracing::debug!(key = %key, "cache payload without metadata, removing entry");
                    self.discard(key).await;
                }
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read cache metadata");
                return None;
            }
        };

        match serde_json::from_slice::<SidecarRecord>(&data) {
            Ok(record) if record.metadata.key == *key => Some(record),
            Ok(_) => {
                tracing::warn!(path = %path.display(), "cache metadata belongs to another key, removing entry");
                self.discard(key).await;
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse cache metadata, removing entry");
                self.discard(key).await;
                None
            }
        }
    }

    /// Store `bytes` with `metadata`, replacing any existing entry in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::DiskIo` if either file cannot be written. A failed
    /// write never leaves a readable mismatched pair behind.
    pub async fn write(&self, key: &ResourceKey, bytes: &Bytes, metadata: &CacheEntryMetadata) -> Result<(), Error> {
        let record =
            SidecarRecord { metadata: metadata.clone(), content_length: bytes.len() as u64, body_sha256: sha256_hex(bytes) };

        let _guard = self.lock(key).await;
        self.commit(&self.payload_path(key), bytes).await?;
        self.write_record(key, &record).await?;

        tracing::debug!(key = %key, bytes = bytes.len(), "stored image on disk");
        Ok(())
    }

    /// Replace the metadata of an existing entry, leaving the payload alone.
    ///
    /// Used when the server answers 304. Returns `Ok(false)` when there is no
    /// intact entry to refresh.
    pub async fn refresh(&self, key: &ResourceKey, metadata: &CacheEntryMetadata) -> Result<bool, Error> {
        let _guard = self.lock(key).await;
        let Some(mut record) = self.read_record(key).await else {
            return Ok(false);
        };
        if !fs::try_exists(self.payload_path(key)).await.unwrap_or(false) {
            self.discard(key).await;
            return Ok(false);
        }
        record.metadata = metadata.clone();
        self.write_record(key, &record).await?;
        Ok(true)
    }

    async fn write_record(&self, key: &ResourceKey, record: &SidecarRecord) -> Result<(), Error> {
        let data = serde_json::to_vec(record)?;
        self.commit(&self.metadata_path(key), &data).await
    }

    /// Write to a temporary file, then rename over `dest`.
    async fn commit(&self, dest: &Path, data: &[u8]) -> Result<(), Error> {
        let temp = self.temp_path();
        if let Err(e) = fs::write(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::disk(&temp, e));
        }
        if let Err(e) = fs::rename(&temp, dest).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::disk(dest, e));
        }
        Ok(())
    }

    /// Remove an entry. Returns whether anything was deleted.
    pub async fn delete(&self, key: &ResourceKey) -> Result<bool, Error> {
        let _guard = self.lock(key).await;
        self.remove_entry(key).await
    }

    /// Payload file for `key` if both halves of the entry are present.
    pub async fn existing_payload(&self, key: &ResourceKey) -> Option<PathBuf> {
        let _guard = self.lock(key).await;
        let path = self.payload_path(key);
        let complete = fs::try_exists(self.metadata_path(key)).await.unwrap_or(false)
            && fs::try_exists(&path).await.unwrap_or(false);
        complete.then_some(path)
    }

    /// Caller holds the key's lock.
    async fn remove_entry(&self, key: &ResourceKey) -> Result<bool, Error> {
        let metadata = remove_if_exists(&self.metadata_path(key)).await?;
        let payload = remove_if_exists(&self.payload_path(key)).await?;
        Ok(metadata || payload)
    }

    async fn discard(&self, key: &ResourceKey) {
        if let Err(e) = self.remove_entry(key).await {
            tracing::warn!(key = %key, error = %e, "failed to remove corrupt cache entry");
        }
    }

    /// Keys of every entry with at least one file on disk.
    pub async fn entries(&self) -> Result<Vec<ResourceKey>, Error> {
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| Error::disk(&self.root, e))?;
        let mut keys = Vec::new();

        while let Some(entry) = dir.next_entry().await.map_err(|e| Error::disk(&self.root, e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stem = name.strip_suffix(PAYLOAD_SUFFIX).or_else(|| name.strip_suffix(METADATA_SUFFIX));
            if let Some(key) = stem.and_then(ResourceKey::from_hex) {
                keys.push(key);
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Delete every entry stored at least `age` ago, regardless of freshness.
    ///
    /// The age comes from the metadata's `stored_at` (refreshed on 304), or
    /// the payload's modification time when the metadata is unreadable.
    /// Returns the number of entries removed.
    pub async fn purge_older_than(&self, age: Duration) -> Result<usize, Error> {
        let cutoff = TimeDelta::from_std(age).ok().and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            tracing::debug!(max_age_secs = age.as_secs(), "purge age predates any stored entry");
            return Ok(0);
        };
        let mut removed = 0;

        for key in self.entries().await? {
            let record = fs::read(self.metadata_path(&key))
                .await
                .ok()
                .and_then(|data| serde_json::from_slice::<SidecarRecord>(&data).ok());
            let stored_at = match record {
                Some(record) => Some(record.metadata.stored_at),
                None => modified_at(&self.payload_path(&key)).await,
            };

            let expired = stored_at.is_none_or(|at| at <= cutoff);
            if expired && self.delete(&key).await? {
                removed += 1;
            }
        }

        tracing::info!(removed, max_age_secs = age.as_secs(), "purged cached images by age");
        Ok(removed)
    }

    /// Delete every entry.
    pub async fn clear(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for key in self.entries().await? {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_temp_files(&self) -> Result<(), Error> {
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| Error::disk(&self.root, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| Error::disk(&self.root, e))? {
            let is_temp = entry.file_name().to_str().is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp {
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::disk(path, e)),
    }
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified: SystemTime = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::metadata::{CacheControl, Validator};
    use tempfile::TempDir;

    fn make_metadata(url: &str, stored_at: DateTime<Utc>) -> CacheEntryMetadata {
        CacheEntryMetadata {
            key: ResourceKey::for_url(url),
            url: url.to_string(),
            validator: Validator { etag: Some("\"abc\"".to_string()), last_modified: None },
            cache_control: CacheControl { max_age: Some(Duration::from_secs(60)), no_store: false, no_cache: false },
            etag_only_ttl: Duration::ZERO,
            stored_at,
            content_type: "image/png".to_string(),
        }
    }

    async fn open_store() -> (TempDir, DiskStore) {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        let bytes = Bytes::from_static(b"\x89PNG fake payload");

        store.write(&meta.key, &bytes, &meta).await.unwrap();

        let (read_bytes, read_meta) = store.read(&meta.key).await.unwrap();
        assert_eq!(read_bytes, bytes);
        assert_eq!(read_meta, meta);
        assert!(store.payload_path(&meta.key).exists());
    }

    #[tokio::test]
    async fn test_read_missing() {
        let (_dir, store) = open_store().await;
        assert!(store.read(&ResourceKey::for_url("https://x/none.png")).await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_in_place() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());

        store.write(&meta.key, &Bytes::from_static(b"old"), &meta).await.unwrap();
        store.write(&meta.key, &Bytes::from_static(b"new"), &meta).await.unwrap();

        let (bytes, _) = store.read(&meta.key).await.unwrap();
        assert_eq!(&bytes[..], b"new");
        assert_eq!(store.entries().await.unwrap(), vec![meta.key.clone()]);
    }

    #[tokio::test]
    async fn test_refresh_keeps_payload() {
        let (_dir, store) = open_store().await;
        let old = Utc::now() - TimeDelta::hours(2);
        let meta = make_metadata("https://x/img.png", old);
        let bytes = Bytes::from_static(b"payload");
        store.write(&meta.key, &bytes, &meta).await.unwrap();

        let refreshed = CacheEntryMetadata { stored_at: Utc::now(), ..meta.clone() };
        assert!(store.refresh(&meta.key, &refreshed).await.unwrap());

        let (read_bytes, read_meta) = store.read(&meta.key).await.unwrap();
        assert_eq!(read_bytes, bytes);
        assert_eq!(read_meta.stored_at, refreshed.stored_at);
    }

    #[tokio::test]
    async fn test_refresh_missing_entry() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        assert!(!store.refresh(&meta.key, &meta).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_after_payload_vanished() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();
        std::fs::remove_file(store.payload_path(&meta.key)).unwrap();

        assert!(!store.refresh(&meta.key, &meta).await.unwrap());
        assert!(store.read_metadata(&meta.key).await.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_removed() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();

        std::fs::write(store.payload_path(&meta.key), b"tampered").unwrap();

        assert!(store.read(&meta.key).await.is_none());
        assert!(!store.payload_path(&meta.key).exists());
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_removed() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();

        std::fs::write(store.metadata_path(&meta.key), b"{not json").unwrap();

        assert!(store.read(&meta.key).await.is_none());
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_without_metadata_is_removed() {
        let (_dir, store) = open_store().await;
        let key = ResourceKey::for_url("https://x/orphan.png");
        std::fs::write(store.payload_path(&key), b"orphan").unwrap();

        assert!(store.read(&key).await.is_none());
        assert!(!store.payload_path(&key).exists());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();

        assert!(store.delete(&meta.key).await.unwrap());
        assert!(!store.delete(&meta.key).await.unwrap());
        assert!(store.read(&meta.key).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let (_dir, store) = open_store().await;
        let old = make_metadata("https://x/old.png", Utc::now() - TimeDelta::hours(25));
        let fresh = make_metadata("https://x/new.png", Utc::now() - TimeDelta::hours(23));
        store.write(&old.key, &Bytes::from_static(b"old"), &old).await.unwrap();
        store.write(&fresh.key, &Bytes::from_static(b"new"), &fresh).await.unwrap();

        let removed = store.purge_older_than(Duration::from_secs(24 * 60 * 60)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.read(&old.key).await.is_none());
        assert!(store.read(&fresh.key).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_with_huge_age_removes_nothing() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now() - TimeDelta::days(365));
        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();

        assert_eq!(store.purge_older_than(Duration::MAX).await.unwrap(), 0);
        assert_eq!(store.purge_older_than(Duration::from_secs(100_000_000 * 86_400)).await.unwrap(), 0);
        assert!(store.read(&meta.key).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_never_lose_a_write() {
        let (_dir, store) = open_store().await;
        let store = std::sync::Arc::new(store);
        let meta = make_metadata("https://x/img.png", Utc::now());
        let v1 = Bytes::from(vec![1u8; 64 * 1024]);
        let v2 = Bytes::from(vec![2u8; 64 * 1024]);

        for _ in 0..50 {
            store.write(&meta.key, &v1, &meta).await.unwrap();

            let writer = std::sync::Arc::clone(&store);
            let (key, bytes, m) = (meta.key.clone(), v2.clone(), meta.clone());
            let mut tasks = vec![tokio::spawn(async move {
                writer.write(&key, &bytes, &m).await.unwrap();
            })];
            for _ in 0..5 {
                let reader = std::sync::Arc::clone(&store);
                let key = meta.key.clone();
                tasks.push(tokio::spawn(async move {
                    let (bytes, _) = reader.read(&key).await.unwrap();
                    assert!(bytes[0] == 1 || bytes[0] == 2);
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let (bytes, _) = store.read(&meta.key).await.unwrap();
            assert_eq!(bytes, v2);
        }
    }

    #[tokio::test]
    async fn test_existing_payload() {
        let (_dir, store) = open_store().await;
        let meta = make_metadata("https://x/img.png", Utc::now());
        assert!(store.existing_payload(&meta.key).await.is_none());

        store.write(&meta.key, &Bytes::from_static(b"payload"), &meta).await.unwrap();
        assert_eq!(store.existing_payload(&meta.key).await, Some(store.payload_path(&meta.key)));

        std::fs::remove_file(store.payload_path(&meta.key)).unwrap();
        assert!(store.existing_payload(&meta.key).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_uses_mtime_without_metadata() {
        let (_dir, store) = open_store().await;
        let key = ResourceKey::for_url("https://x/orphan.png");
        std::fs::write(store.payload_path(&key), b"orphan").unwrap();

        assert_eq!(store.purge_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.purge_older_than(Duration::ZERO).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_removes_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tmp_1_1"), b"partial").unwrap();

        let store = DiskStore::open(dir.path()).await.unwrap();

        assert!(!dir.path().join("tmp_1_1").exists());
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, store) = open_store().await;
        for url in ["https://x/a.png", "https://x/b.png"] {
            let meta = make_metadata(url, Utc::now());
            store.write(&meta.key, &Bytes::from_static(b"x"), &meta).await.unwrap();
        }
        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.entries().await.unwrap().is_empty());
    }
}
