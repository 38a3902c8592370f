//! Blob storage.
//!
//! Durable key/value blobs used by the position store, the object-store
//! backed sink destinations and the buffered transport.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit tests and simulation
//! - `LocalFsObjectStore`: a directory on local disk
//! - `SimulatedObjectStore`: fault-injecting wrapper for simulation
//!
//! Besides plain puts, stores support a conditional write keyed on an
//! entity tag so lease and checkpoint records can be updated with
//! compare-and-swap semantics.

pub mod simulated;

pub use simulated::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub etag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectMeta>,
    pub continuation_token: Option<String>,
}

/// Precondition for [`ObjectStore::put_if`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Object must not exist yet.
    Absent,
    /// Object must exist with this entity tag.
    Matches(String),
}

/// Content-derived entity tag.
pub fn etag_of(data: &[u8]) -> String {
    format!("{:08x}-{}", crc32fast::hash(data), data.len())
}

/// Whether an I/O error from a store is worth retrying.
pub fn is_transient(err: &IoError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidData
            | ErrorKind::InvalidInput
            | ErrorKind::AlreadyExists
    )
}

/// Object store abstraction trait.
pub trait ObjectStore: Send + Sync + 'static {
    /// Create or overwrite.
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Write only if `condition` holds. Returns the new entity tag, or `None`
    /// when the precondition failed.
    fn put_if<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        condition: &'a PutCondition,
    ) -> StoreFuture<'a, Option<String>>;

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Contents and entity tag. `None` if the key does not exist.
    fn get_versioned<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<(Vec<u8>, String)>> {
        Box::pin(async move {
            match self.get(key).await {
                Ok(data) => {
                    let etag = etag_of(&data);
                    Ok(Some((data, etag)))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Deleting a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Keys starting with `prefix`, sorted.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListResult>;

    /// Atomic replace, used for temp-then-rename manifest updates.
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()>;
}

/// Shared handle used across the crate.
pub type SharedStore = Arc<dyn ObjectStore>;

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn put_if<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        condition: &'a PutCondition,
    ) -> StoreFuture<'a, Option<String>> {
        (**self).put_if(key, data, condition)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        (**self).get(key)
    }

    fn get_versioned<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<(Vec<u8>, String)>> {
        (**self).get_versioned(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        (**self).delete(key)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListResult> {
        (**self).list(prefix, continuation_token)
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        (**self).rename(from, to)
    }
}

fn not_found(key: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }

    fn put_if<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        condition: &'a PutCondition,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut map = self.data.write();
            let holds = match (condition, map.get(key)) {
                (PutCondition::Absent, None) => true,
                (PutCondition::Matches(expected), Some(current)) => etag_of(current) == *expected,
                _ => false,
            };
            if !holds {
                return Ok(None);
            }
            map.insert(key.to_string(), data.to_vec());
            Ok(Some(etag_of(data)))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { self.data.read().get(key).cloned().ok_or_else(|| not_found(key)) })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            let data = self.data.read();
            let mut objects: Vec<ObjectMeta> = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                    etag: etag_of(v),
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut data = self.data.write();
            let obj = data.remove(from).ok_or_else(|| not_found(from))?;
            data.insert(to.to_string(), obj);
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsObjectStore
// ============================================================================

/// Objects as files under a base directory.
///
/// `put_if` with [`PutCondition::Absent`] uses exclusive create and is safe
/// across processes. [`PutCondition::Matches`] is serialized per store
/// instance (and its clones) only.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
    cas_lock: Arc<Mutex<()>>,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
            cas_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn write_atomic(path: &Path, data: &[u8]) -> IoResult<()> {
        use std::io::Write;
        let tmp = path.with_extension("cas-tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    }

    fn walk(dir: &Path, base: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk(&path, base, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            if key.starts_with(prefix) && !key.ends_with(".cas-tmp") {
                let data = std::fs::read(&path)?;
                out.push(ObjectMeta {
                    key,
                    size_bytes: data.len() as u64,
                    etag: etag_of(&data),
                });
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            Self::ensure_parent(&path)?;
            tokio::fs::write(&path, data).await
        })
    }

    fn put_if<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        condition: &'a PutCondition,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            use std::io::Write;
            let path = self.full_path(key);
            Self::ensure_parent(&path)?;
            let _guard = self.cas_lock.lock();
            match condition {
                PutCondition::Absent => {
                    let file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&path);
                    match file {
                        Ok(mut f) => {
                            f.write_all(data)?;
                            f.sync_all()?;
                        }
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
                        Err(e) => return Err(e),
                    }
                }
                PutCondition::Matches(expected) => {
                    let current = match std::fs::read(&path) {
                        Ok(current) => current,
                        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                        Err(e) => return Err(e),
                    };
                    if etag_of(&current) != *expected {
                        return Ok(None);
                    }
                    Self::write_atomic(&path, data)?;
                }
            }
            Ok(Some(etag_of(data)))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.full_path(key).is_file()) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix_path = base.join(prefix);
            let search_dir = if prefix_path.is_dir() {
                prefix_path
            } else {
                prefix_path.parent().unwrap_or(&base).to_path_buf()
            };
            if !search_dir.exists() {
                return Ok(ListResult::default());
            }
            let mut objects = Vec::new();
            Self::walk(&search_dir, &base, prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let to_path = self.full_path(to);
            Self::ensure_parent(&to_path)?;
            tokio::fs::rename(self.full_path(from), &to_path).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();
        store.put("positions/orders.json", b"{}").await.unwrap();
        assert_eq!(store.get("positions/orders.json").await.unwrap(), b"{}");
        assert!(store.get("positions/missing.json").await.is_err());
    }

    #[tokio::test]
    async fn test_inmemory_list_is_sorted_and_prefixed() {
        let store = InMemoryObjectStore::new();
        store.put("topics/changes/0000/00000002.seg", b"2").await.unwrap();
        store.put("topics/changes/0000/00000001.seg", b"1").await.unwrap();
        store.put("topics/changes/0001/00000001.seg", b"x").await.unwrap();

        let result = store.list("topics/changes/0000/", None).await.unwrap();
        let keys: Vec<_> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["topics/changes/0000/00000001.seg", "topics/changes/0000/00000002.seg"]
        );
    }

    #[tokio::test]
    async fn test_inmemory_rename_replaces_target() {
        let store = InMemoryObjectStore::new();
        store.put("manifest.json", b"old").await.unwrap();
        store.put("manifest.json.tmp", b"new").await.unwrap();
        store.rename("manifest.json.tmp", "manifest.json").await.unwrap();
        assert!(!store.exists("manifest.json.tmp").await.unwrap());
        assert_eq!(store.get("manifest.json").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_put_if_absent_then_matches() {
        let store = InMemoryObjectStore::new();
        let first = store
            .put_if("lease", b"a", &PutCondition::Absent)
            .await
            .unwrap()
            .expect("first create wins");
        assert!(store
            .put_if("lease", b"b", &PutCondition::Absent)
            .await
            .unwrap()
            .is_none());

        let stale = PutCondition::Matches("bogus".to_string());
        assert!(store.put_if("lease", b"c", &stale).await.unwrap().is_none());

        let ok = PutCondition::Matches(first);
        assert!(store.put_if("lease", b"d", &ok).await.unwrap().is_some());
        assert_eq!(store.get("lease").await.unwrap(), b"d");
    }

    #[tokio::test]
    async fn test_get_versioned_missing_is_none() {
        let store = InMemoryObjectStore::new();
        assert!(store.get_versioned("nope").await.unwrap().is_none());
        store.put("k", b"v").await.unwrap();
        let (data, etag) = store.get_versioned("k").await.unwrap().unwrap();
        assert_eq!(data, b"v");
        assert_eq!(etag, etag_of(b"v"));
    }

    #[tokio::test]
    async fn test_localfs_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("sinks/audit/00000001.json", b"[1]").await.unwrap();
        store.put("sinks/audit/00000002.json", b"[2]").await.unwrap();
        store.put("positions/orders.lease", b"lease").await.unwrap();

        assert_eq!(store.get("sinks/audit/00000001.json").await.unwrap(), b"[1]");
        let result = store.list("sinks/audit/", None).await.unwrap();
        assert_eq!(result.objects.len(), 2);
    }

    #[tokio::test]
    async fn test_localfs_put_if() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        let etag = store
            .put_if("state/p1.json", b"v1", &PutCondition::Absent)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .put_if("state/p1.json", b"v1", &PutCondition::Absent)
            .await
            .unwrap()
            .is_none());
        let next = store
            .put_if("state/p1.json", b"v2", &PutCondition::Matches(etag.clone()))
            .await
            .unwrap();
        assert!(next.is_some());
        assert!(store
            .put_if("state/p1.json", b"v3", &PutCondition::Matches(etag))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.get("state/p1.json").await.unwrap(), b"v2");
    }
}
