//! Asynchronous key-value backend contract and the in-memory reference
//! implementation.
//!
//! The block store persists files as flat string-keyed records:
//!
//! ```text
//! {name}\0m              file metadata
//! {name}\0l              persisted lock marker (one byte, lock level)
//! {name}\0b\0{index:010} block payload
//! ```
//!
//! `{name}\0` is the prefix used for whole-file deletion, which is why NUL
//! is forbidden in file names.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tabsql_error::Result;

/// Metadata record key for a file.
#[must_use]
pub fn meta_key(name: &str) -> String {
    format!("{name}\0m")
}

/// Persisted lock marker key for a file.
#[must_use]
pub fn lock_key(name: &str) -> String {
    format!("{name}\0l")
}

/// Block record key for `(file name, block index)`.
///
/// The index is zero-padded so lexicographic key order matches block order.
#[must_use]
pub fn block_key(name: &str, index: u32) -> String {
    format!("{name}\0b\0{index:010}")
}

/// The deletion prefix covering every record of a file.
#[must_use]
pub fn file_prefix(name: &str) -> String {
    format!("{name}\0")
}

/// An asynchronous, ordered key-value store.
///
/// This is the only persistence interface the block store uses. The single
/// hard requirement is that [`KvBackend::put_batch`] is atomic: either every
/// put and delete in the batch is applied or none of them is. Backends that
/// cannot honor that must reject the batch with an I/O error.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically apply a set of puts and deletes.
    async fn put_batch(&self, puts: Vec<(String, Vec<u8>)>, deletes: Vec<String>) -> Result<()>;

    /// Remove every key that starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Whether `key` is present.
    async fn contains(&self, key: &str) -> Result<bool>;
}

/// In-memory [`KvBackend`] over an ordered map.
///
/// Clones share storage, so a "restarted" block store can be simulated by
/// building a fresh store over a clone of the backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    map: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    /// Whether the backend holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.map.lock().expect("memory backend lock poisoned")
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_map().get(key).cloned())
    }

    async fn put_batch(&self, puts: Vec<(String, Vec<u8>)>, deletes: Vec<String>) -> Result<()> {
        let mut map = self.lock_map();
        for (key, value) in puts {
            map.insert(key, value);
        }
        for key in deletes {
            map.remove(&key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut map = self.lock_map();
        let doomed: Vec<String> = map
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lock_map().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(meta_key("a.db"), "a.db\0m");
        assert_eq!(lock_key("a.db"), "a.db\0l");
        assert_eq!(block_key("a.db", 7), "a.db\0b\00000000007");
        assert!(meta_key("a.db").starts_with(&file_prefix("a.db")));
        assert!(block_key("a.db", 0).starts_with(&file_prefix("a.db")));
    }

    #[test]
    fn block_keys_sort_in_index_order() {
        let k1 = block_key("f", 2);
        let k2 = block_key("f", 10);
        let k3 = block_key("f", 100);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[tokio::test]
    async fn put_batch_and_get() {
        let backend = MemoryBackend::new();
        backend
            .put_batch(
                vec![
                    ("k1".to_owned(), b"v1".to_vec()),
                    ("k2".to_owned(), b"v2".to_vec()),
                ],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(backend.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.get("missing").await.unwrap(), None);
        assert!(backend.contains("k2").await.unwrap());
    }

    #[tokio::test]
    async fn put_batch_applies_deletes() {
        let backend = MemoryBackend::new();
        backend
            .put_batch(vec![("k1".to_owned(), b"v1".to_vec())], vec![])
            .await
            .unwrap();
        backend
            .put_batch(
                vec![("k2".to_owned(), b"v2".to_vec())],
                vec!["k1".to_owned()],
            )
            .await
            .unwrap();

        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert!(backend.contains("k2").await.unwrap());
    }

    #[tokio::test]
    async fn delete_prefix_is_scoped() {
        let backend = MemoryBackend::new();
        backend
            .put_batch(
                vec![
                    (meta_key("a"), vec![1]),
                    (block_key("a", 0), vec![2]),
                    (block_key("a", 1), vec![3]),
                    (meta_key("ab"), vec![4]),
                ],
                vec![],
            )
            .await
            .unwrap();

        backend.delete_prefix(&file_prefix("a")).await.unwrap();

        assert_eq!(backend.get(&meta_key("a")).await.unwrap(), None);
        assert_eq!(backend.get(&block_key("a", 0)).await.unwrap(), None);
        // "ab" does not share the prefix "a\0".
        assert!(backend.contains(&meta_key("ab")).await.unwrap());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend
            .put_batch(vec![("k".to_owned(), b"v".to_vec())], vec![])
            .await
            .unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
