use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::StateStore;

type RecordKey = (&'static str, String);

/// Debounced writer for entity records.
///
/// Changes are coalesced in a dirty set (the latest value per key wins) and
/// written in the background on each [`flush`](Self::flush). Only one write
/// batch is in flight at a time; records that failed to save are merged back
/// and retried on the next flush unless a newer value arrived meanwhile.
pub struct Persister {
    store: Arc<dyn StateStore>,
    pending: BTreeMap<RecordKey, Value>,
    failed: Arc<Mutex<Vec<(RecordKey, Value)>>>,
    in_flight: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            failed: Arc::new(Mutex::new(Vec::new())),
            in_flight: None,
        }
    }

    pub fn mark_dirty<T: Serialize>(&mut self, namespace: &'static str, key: &str, record: &T) {
        match serde_json::to_value(record) {
            Ok(value) => {
                self.pending.insert((namespace, key.to_string()), value);
            }
            Err(e) => warn!(namespace, key, error = %e, "record not serializable, skipped"),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Start a background write of everything dirty.
    pub fn flush(&mut self) {
        if self.in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.requeue_failed();
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        let store = self.store.clone();
        let failed = self.failed.clone();
        self.in_flight = Some(tokio::spawn(async move {
            for (key, value) in batch {
                if let Err(e) = store.save(key.0, &key.1, value.clone()).await {
                    warn!(namespace = key.0, key = %key.1, error = %e, "state save failed, will retry");
                    failed.lock().push((key, value));
                }
            }
        }));
    }

    /// Wait for the running batch, then write everything still dirty.
    pub async fn flush_now(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "state write task failed");
            }
        }
        self.requeue_failed();

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        for (key, value) in batch {
            if let Err(e) = self.store.save(key.0, &key.1, value).await {
                warn!(namespace = key.0, key = %key.1, error = %e, "final state save failed");
            }
        }
        debug!(records = count, "state flushed");
    }

    fn requeue_failed(&mut self) {
        let failed = std::mem::take(&mut *self.failed.lock());
        for (key, value) in failed {
            self.pending.entry(key).or_insert(value);
        }
    }
}
