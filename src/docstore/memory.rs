//! In-memory `DocumentStore` used by tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::domain::Result;

use super::{ChangeEvent, ChangeKind, Document, DocumentStore, TxnOutcome};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
struct StoredDoc {
    data: Value,
    update_time: DateTime<Utc>,
}

/// All document mutations run under one async mutex, which makes every
/// single-document update (and `modify` in particular) linearizable. Change
/// channels live behind a separate sync lock so `watch` stays non-async.
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, StoredDoc>>>,
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            channels: std::sync::Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<ChangeEvent> {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, collection: &str, kind: ChangeKind, id: &str, doc: &StoredDoc) {
        // Send failures just mean nobody is listening.
        let _ = self.sender(collection).send(ChangeEvent {
            kind,
            collection: collection.to_string(),
            document: Document {
                id: id.to_string(),
                data: doc.data.clone(),
                update_time: doc.update_time,
            },
        });
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| Document {
                id: id.to_string(),
                data: stored.data.clone(),
                update_time: stored.update_time,
            }))
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let stored = StoredDoc {
            data,
            update_time: self.clock.now_utc(),
        };
        let existed = collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), stored.clone())
            .is_some();
        drop(collections);
        let kind = if existed {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.publish(collection, kind, id, &stored);
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let existing = collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| stored.data.clone());

        let merged = match (existing.clone(), data) {
            (Some(Value::Object(mut base)), Value::Object(patch)) => {
                for (key, value) in patch {
                    base.insert(key, value);
                }
                Value::Object(base)
            }
            (_, patch) => patch,
        };

        let stored = StoredDoc {
            data: merged,
            update_time: self.clock.now_utc(),
        };
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), stored.clone());
        drop(collections);
        let kind = if existing.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.publish(collection, kind, id, &stored);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        drop(collections);
        if let Some(stored) = removed {
            self.publish(collection, ChangeKind::Removed, id, &stored);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, stored)| Document {
                        id: id.clone(),
                        data: stored.data.clone(),
                        update_time: stored.update_time,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn modify(
        &self,
        collection: &str,
        id: &str,
        mutate: &(dyn for<'a> Fn(Option<&'a Value>) -> TxnOutcome + Send + Sync),
    ) -> Result<bool> {
        let mut collections = self.collections.lock().await;
        let current = collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| stored.data.clone());

        match mutate(current.as_ref()) {
            TxnOutcome::Abort => Ok(false),
            TxnOutcome::Set(next) => {
                let stored = StoredDoc {
                    data: next,
                    update_time: self.clock.now_utc(),
                };
                collections
                    .entry(collection.to_string())
                    .or_default()
                    .insert(id.to_string(), stored.clone());
                drop(collections);
                let kind = if current.is_some() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                };
                self.publish(collection, kind, id, &stored);
                Ok(true)
            }
            TxnOutcome::Delete => {
                let removed = collections
                    .get_mut(collection)
                    .and_then(|docs| docs.remove(id));
                drop(collections);
                if let Some(stored) = removed {
                    self.publish(collection, ChangeKind::Removed, id, &stored);
                }
                Ok(true)
            }
        }
    }

    fn watch(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        self.sender(collection).subscribe()
    }
}
