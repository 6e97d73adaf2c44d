//! Local store adapter: a thin interface over the embedded key-value engine.
//!
//! The adapter is mutated only from the single-threaded apply path. Reads may
//! run concurrently from the request-serving tasks; sled supports concurrent
//! readers with a single writer, so no extra locking is layered on top.

use std::path::Path;

use thiserror::Error;

const DATA_TREE: &str = "data";
const META_TREE: &str = "meta";
const APPLIED_INDEX_KEY: &[u8] = b"applied_index";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),
    #[error("corrupt applied-index marker")]
    CorruptMarker,
}

/// Handle to the embedded store. Cloning shares the same underlying database.
#[derive(Clone)]
pub struct KvStore {
    db: sled::Db,
    data: sled::Tree,
    meta: sled::Tree,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<KvStore, StoreError> {
        let db = sled::open(path)?;
        let data = db.open_tree(DATA_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(KvStore { db, data, meta })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.insert(key, value)?;
        Ok(())
    }

    /// Removes a key. Returns false when the key was absent; callers treat
    /// that as a handled outcome, not an error.
    pub fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.data.remove(key)?.is_some())
    }

    /// Last replicated-log index folded into this store, 0 if none.
    ///
    /// The marker is what makes a snapshot reproducible: loading a snapshot
    /// and replaying only entries after this index reaches the same contents
    /// as a full replay.
    pub fn applied_index(&self) -> Result<u64, StoreError> {
        match self.meta.get(APPLIED_INDEX_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::CorruptMarker)?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn set_applied_index(&self, index: u64) -> Result<(), StoreError> {
        self.meta.insert(APPLIED_INDEX_KEY, &index.to_be_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Full contents of the data tree in key order.
    pub fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for item in self.data.iter() {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> KvStore {
        KvStore::open(dir.path().join("db")).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        assert!(store.delete(b"a").unwrap());
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert!(!store.delete(b"missing").unwrap());
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_applied_index_marker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.applied_index().unwrap(), 0);
        store.set_applied_index(42).unwrap();
        assert_eq!(store.applied_index().unwrap(), 42);

        // Survives reopen.
        drop(store);
        let store = open_store(&dir);
        assert_eq!(store.applied_index().unwrap(), 42);
    }

    #[test]
    fn test_dump_is_ordered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        let dump = store.dump().unwrap();
        assert_eq!(
            dump,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
        );
    }
}
