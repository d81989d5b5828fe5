use crate::error::{CidmarkError, Result};
use crate::store::{ContentStoreBackend, StoreHandle};
use crate::types::ContentId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// Bookkeeping row for an ingested object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub cid: String,
    pub name: String,
    pub size: u64,
    pub added_at: DateTime<Utc>,
}

/// Filesystem content store.
///
/// Objects live in `objects/{cid[..2]}/{cid}` where the cid is the hex SHA256
/// of the bytes. Names are recorded in `index.db` and never affect addressing.
pub struct LocalContentStore {
    base_path: PathBuf,
}

impl LocalContentStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Most recent bookkeeping row for `cid`.
    pub fn lookup(&self, cid: &ContentId) -> Result<Option<StoredObject>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT cid, name, size, added_at FROM objects
                 WHERE cid = ?1 ORDER BY pk DESC LIMIT 1",
                params![cid.as_str()],
                |row| {
                    let size: i64 = row.get(2)?;
                    let added_at: String = row.get(3)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, size, added_at))
                },
            )
            .optional()?;

        let Some((cid, name, size, added_at)) = row else {
            return Ok(None);
        };

        let added_at = DateTime::parse_from_rfc3339(&added_at)
            .map_err(|e| CidmarkError::Internal(format!("invalid added_at '{}': {}", added_at, e)))?
            .with_timezone(&Utc);

        Ok(Some(StoredObject {
            cid,
            name,
            size: size as u64,
            added_at,
        }))
    }

    fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Path of the object named `hash`, `None` unless `hash` is a lowercase
    /// hex SHA256 so nothing outside `objects/` is ever addressed.
    fn object_path(&self, hash: &str) -> Option<PathBuf> {
        if !is_object_id(hash) {
            return None;
        }
        // Use first 2 chars as subdirectory to avoid too many files in one dir
        Some(self.objects_dir().join(&hash[..2]).join(hash))
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(self.base_path.join("index.db"))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                cid TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                added_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_cid ON objects(cid)",
            [],
        )?;
        Ok(())
    }

    fn record_object(&self, hash: &str, name: &str, size: u64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO objects (cid, name, size, added_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash, name, size as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn write_object(&self, hash: &str, body: &[u8]) -> std::io::Result<()> {
        let object_path = self.object_path(hash).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not an object id")
        })?;
        if object_path.exists() {
            return Ok(());
        }

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temporary file first, then rename for atomicity
        let temp = TempObject::new(object_path.with_extension(format!("{}.tmp", Ulid::new())));
        let mut file = fs::File::create(temp.path()).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(temp.path(), &object_path).await?;
        temp.persist();
        Ok(())
    }
}

#[async_trait]
impl ContentStoreBackend for LocalContentStore {
    async fn start(&self) -> Result<StoreHandle> {
        let objects_dir = self.objects_dir();
        fs::create_dir_all(&objects_dir).await.map_err(|e| {
            CidmarkError::StoreUnavailable(format!(
                "cannot create {}: {}",
                objects_dir.display(),
                e
            ))
        })?;

        self.init_schema().map_err(|e| {
            CidmarkError::StoreUnavailable(format!(
                "cannot open index in {}: {}",
                self.base_path.display(),
                e
            ))
        })?;

        Ok(StoreHandle {
            backend: "local".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        })
    }

    async fn add(&self, body: Bytes, name: &str) -> Result<ContentId> {
        let hash = compute_hash(&body);

        self.write_object(&hash, &body).await.map_err(|e| {
            CidmarkError::IngestError(format!("failed to write object {}: {}", hash, e))
        })?;
        self.record_object(&hash, name, body.len() as u64)
            .map_err(|e| CidmarkError::IngestError(format!("failed to index {}: {}", hash, e)))?;

        tracing::debug!("Stored object {} ({} bytes, name={})", hash, body.len(), name);
        ContentId::new(hash)
    }

    async fn get(&self, cid: &ContentId) -> Result<Bytes> {
        let object_path = self
            .object_path(cid.as_str())
            .filter(|path| path.is_file())
            .ok_or_else(|| CidmarkError::ContentNotFound(cid.to_string()))?;

        let data = fs::read(&object_path).await?;
        verify_hash(&data, cid.as_str())?;
        Ok(Bytes::from(data))
    }
}

/// Temporary object file, removed on drop unless persisted.
struct TempObject {
    path: PathBuf,
    persisted: bool,
}

impl TempObject {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; called once it has been renamed into place.
    fn persist(mut self) {
        self.persisted = true;
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove temp object {}: {}", self.path.display(), e);
            }
        }
    }
}

fn is_object_id(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        tracing::error!(
            "hash mismatch: expected {}, actual {}",
            expected_hash,
            actual_hash
        );
        return Err(CidmarkError::Internal(
            "stored object failed integrity check".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started_store() -> (tempfile::TempDir, LocalContentStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(temp_dir.path().to_path_buf());
        store.start().await.unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (_dir, store) = started_store().await;

        let data = Bytes::from("test data content");
        let cid = store.add(data.clone(), "notes.txt").await.unwrap();
        assert_eq!(cid.as_str(), compute_hash(&data));

        let retrieved = store.get(&cid).await.unwrap();
        assert_eq!(retrieved, data);

        let entry = store.lookup(&cid).unwrap().unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert_eq!(entry.size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_same_bytes_same_cid_regardless_of_name() {
        let (_dir, store) = started_store().await;

        let first = store.add(Bytes::from("hello"), "a.txt").await.unwrap();
        let second = store.add(Bytes::from("hello"), "b.txt").await.unwrap();
        assert_eq!(first, second);

        // the latest name wins for bookkeeping
        assert_eq!(store.lookup(&first).unwrap().unwrap().name, "b.txt");
    }

    #[tokio::test]
    async fn test_get_unknown_cid() {
        let (_dir, store) = started_store().await;
        let cid = ContentId::new(compute_hash(b"never stored")).unwrap();

        let err = store.get(&cid).await.unwrap_err();
        assert!(matches!(err, CidmarkError::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_fails_when_base_path_is_a_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("occupied");
        std::fs::write(&file_path, b"not a directory").unwrap();

        let store = LocalContentStore::new(file_path);
        let err = store.start().await.unwrap_err();
        assert!(matches!(err, CidmarkError::StoreUnavailable(_)));
    }

    fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.to_string_lossy().ends_with(".tmp") {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn test_get_rejects_paths_outside_objects_dir() {
        let (_dir, store) = started_store().await;

        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, b"top secret").unwrap();

        for raw in [
            secret.to_string_lossy().to_string(),
            "../index.db".to_string(),
            compute_hash(b"x").to_uppercase(),
        ] {
            let cid = ContentId::new(raw).unwrap();
            let err = store.get(&cid).await.unwrap_err();
            assert!(matches!(err, CidmarkError::ContentNotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_corrupt_object_does_not_echo_hashes() {
        let (_dir, store) = started_store().await;
        let cid = store.add(Bytes::from("original"), "a.txt").await.unwrap();

        let path = store.object_path(cid.as_str()).unwrap();
        std::fs::write(&path, b"tampered").unwrap();

        let err = store.get(&cid).await.unwrap_err();
        assert!(matches!(err, CidmarkError::Internal(_)));
        assert!(!err.to_string().contains(&compute_hash(b"tampered")));
    }

    #[tokio::test]
    async fn test_add_leaves_no_temp_files() {
        let (dir, store) = started_store().await;
        store.add(Bytes::from("hello"), "a.txt").await.unwrap();
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_dropped_temp_object_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let abandoned = dir.path().join("abandoned.tmp");
        let kept = dir.path().join("kept.tmp");
        std::fs::write(&abandoned, b"partial").unwrap();
        std::fs::write(&kept, b"complete").unwrap();

        drop(TempObject::new(abandoned.clone()));
        TempObject::new(kept.clone()).persist();

        assert!(!abandoned.exists());
        assert!(kept.exists());
    }

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"hello world");
        assert_eq!(hash.len(), 64);
        assert!(verify_hash(b"hello world", &hash).is_ok());
        assert!(verify_hash(b"hello", &hash).is_err());
    }
}
