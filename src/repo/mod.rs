//! # Entity state persistence
//!
//! Batteries and consumers keep a small record (timestamps, block state,
//! efficiency figures) that must survive restarts. Records are JSON values
//! keyed by `(namespace, key)`; writes are debounced by [`Persister`] so
//! flash storage is not hit on every state change.

pub mod persistence;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

pub use persistence::Persister;

/// Storage failures. Logged and retried on the next flush, never fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Load and decode one record.
pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(namespace, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<(String, String), Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// One JSON file per record under `<root>/<namespace>/<key>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    root: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize(namespace))
            .join(format!("{}.json", sanitize(key)))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(namespace, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
