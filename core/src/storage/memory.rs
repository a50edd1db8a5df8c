//! In-memory storage backend with shadow-map transactions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;

use super::{apply_query, QueryOptions, StorageBackend, StorageItem};

#[derive(Default)]
struct TxState {
    shadow: HashMap<String, StorageItem>,
    deleted: HashSet<String>,
}

#[derive(Default)]
struct MemoryInner {
    store: HashMap<String, StorageItem>,
    tx: Option<TxState>,
}

/// Backend holding everything in a `HashMap`. While a transaction is open,
/// writes go to a shadow map plus a deleted-key set and reads resolve
/// shadow-first.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys_inner(inner: &MemoryInner, options: &QueryOptions) -> Vec<String> {
        let mut keys: Vec<String> = match &inner.tx {
            Some(tx) => {
                let mut set: HashSet<&String> = inner
                    .store
                    .keys()
                    .filter(|k| !tx.deleted.contains(*k))
                    .collect();
                set.extend(tx.shadow.keys());
                set.into_iter().cloned().collect()
            }
            None => inner.store.keys().cloned().collect(),
        };

        if let Some(prefix) = &options.prefix {
            keys.retain(|k| k.starts_with(prefix.as_str()));
        }
        keys.sort();
        keys
    }

    fn get_inner(inner: &MemoryInner, key: &str) -> Option<StorageItem> {
        if let Some(tx) = &inner.tx {
            if let Some(item) = tx.shadow.get(key) {
                return Some(item.clone());
            }
            if tx.deleted.contains(key) {
                return None;
            }
        }
        inner.store.get(key).cloned()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn set(&self, key: &str, item: StorageItem) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.tx {
            Some(tx) => {
                tx.shadow.insert(key.to_string(), item);
            }
            None => {
                inner.store.insert(key.to_string(), item);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StorageItem>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::get_inner(&inner, key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.store.contains_key(key);
        match &mut inner.tx {
            Some(tx) => {
                let shadowed = tx.shadow.remove(key).is_some();
                tx.deleted.insert(key.to_string());
                Ok(existed || shadowed)
            }
            None => Ok(inner.store.remove(key).is_some()),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let main_keys: Vec<String> = inner.store.keys().cloned().collect();
        match &mut inner.tx {
            Some(tx) => {
                tx.shadow.clear();
                tx.deleted.extend(main_keys);
            }
            None => inner.store.clear(),
        }
        Ok(())
    }

    async fn keys(&self, options: &QueryOptions) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::keys_inner(&inner, options))
    }

    async fn query(&self, options: &QueryOptions) -> Result<Vec<StorageItem>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let items = Self::keys_inner(&inner, options)
            .into_iter()
            .filter_map(|k| Self::get_inner(&inner, &k))
            .collect();
        Ok(apply_query(items, options))
    }

    async fn begin_transaction(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tx.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        inner.tx = Some(TxState::default());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner.tx.take().ok_or(StorageError::NoTransaction)?;
        // Deletions apply first, so a delete-then-set on the same key within
        // one transaction leaves the recreated value in place.
        for key in tx.deleted {
            inner.store.remove(&key);
        }
        for (key, item) in tx.shadow {
            inner.store.insert(key, item);
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tx.take().is_none() {
            return Err(StorageError::NoTransaction);
        }
        Ok(())
    }
}
