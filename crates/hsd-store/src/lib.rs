//! Document-store abstraction + in-memory reference backend for HSD.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hsd-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {id} not found in {collection}")]
    NotFound { collection: String, id: String },
    #[error("transient store failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Le,
    Lt,
    Ge,
    Gt,
}

/// Top-level field filter applied by `query` and `subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Le, value)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        let actual = &doc[self.field.as_str()];
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            _ => match compare_values(actual, &self.value) {
                Some(ordering) => match self.op {
                    FilterOp::Le => ordering != Ordering::Greater,
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Ge => ordering != Ordering::Less,
                    FilterOp::Gt => ordering == Ordering::Greater,
                    FilterOp::Eq | FilterOp::Ne => unreachable!(),
                },
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }
}

/// Ordering over JSON scalars. RFC 3339 strings compare chronologically so
/// timestamp fields order correctly regardless of fractional-second width.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn matches_filters(doc: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

/// Queryable, subscribable document store. `conditional_update` must be an
/// atomic read-modify-write: the predicate is evaluated and the patch applied
/// under the same exclusion, never as a separate read followed by a write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create(&self, collection: &str, doc: Value) -> Result<String, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError>;

    async fn conditional_update(
        &self,
        collection: &str,
        id: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Sync),
        patch: Value,
    ) -> Result<bool, StoreError>;

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
    ) -> Result<Vec<Value>, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
    ) -> Result<Subscription, StoreError>;
}

struct Subscriber {
    collection: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Vec<Value>>,
}

type SubscriberRegistry = Arc<Mutex<HashMap<u64, Subscriber>>>;

/// Explicit, cancellable snapshot stream for one collection + filter set.
///
/// Each mutation of the collection delivers a fresh filtered snapshot; there
/// are no ambient observer callbacks. Dropping the handle also ends the
/// stream; `cancel` deregisters eagerly.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Vec<Value>>,
    registry: SubscriberRegistry,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        self.rx.recv().await
    }

    pub async fn cancel(mut self) {
        self.rx.close();
        self.registry.lock().await.remove(&self.id);
    }
}

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-memory backend used by the engine tests and the CLI demo.
///
/// A single async mutex guards all collections, which makes
/// `conditional_update` a true compare-and-swap against current state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
    subscribers: SubscriberRegistry,
    next_sub_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, collection: &str, snapshot: Vec<Value>) {
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (id, sub) in subs.iter() {
            if sub.collection != collection {
                continue;
            }
            let filtered: Vec<Value> = snapshot
                .iter()
                .filter(|doc| matches_filters(doc, &sub.filters))
                .cloned()
                .collect();
            if sub.tx.send(filtered).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(subscription_id = id, collection, "pruning closed subscriber");
            subs.remove(&id);
        }
    }

    fn snapshot(collections: &Collections, collection: &str) -> Vec<Value> {
        collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, mut doc: Value) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| StoreError::Transient("document must be a JSON object".into()))?;
        obj.insert("id".into(), Value::String(id.clone()));

        let snapshot = {
            let mut collections = self.inner.lock().await;
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.clone(), doc);
            Self::snapshot(&collections, collection)
        };
        self.notify(collection, snapshot).await;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        let collections = self.inner.lock().await;
        collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn conditional_update(
        &self,
        collection: &str,
        id: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Sync),
        patch: Value,
    ) -> Result<bool, StoreError> {
        let patch_obj = match patch {
            Value::Object(map) => map,
            _ => return Err(StoreError::Transient("patch must be a JSON object".into())),
        };

        let (applied, snapshot) = {
            let mut collections = self.inner.lock().await;
            let doc = collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;

            if !predicate(doc) {
                return Ok(false);
            }

            let obj = doc
                .as_object_mut()
                .ok_or_else(|| StoreError::Transient("stored document is not an object".into()))?;
            for (key, value) in patch_obj {
                obj.insert(key, value);
            }
            (true, Self::snapshot(&collections, collection))
        };

        if applied {
            self.notify(collection, snapshot).await;
        }
        Ok(applied)
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.inner.lock().await;
        let mut docs: Vec<Value> = Self::snapshot(&collections, collection)
            .into_iter()
            .filter(|doc| matches_filters(doc, filters))
            .collect();
        drop(collections);

        if let Some(order) = order_by {
            docs.sort_by(|a, b| {
                let ordering = compare_values(&a[order.field.as_str()], &b[order.field.as_str()])
                    .unwrap_or(Ordering::Equal);
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(docs)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let snapshot = {
            let mut collections = self.inner.lock().await;
            let removed = collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id));
            if removed.is_none() {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            Self::snapshot(&collections, collection)
        };
        self.notify(collection, snapshot).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
    ) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id.fetch_add(1, AtomicOrdering::Relaxed);

        let initial: Vec<Value> = {
            let collections = self.inner.lock().await;
            Self::snapshot(&collections, collection)
                .into_iter()
                .filter(|doc| matches_filters(doc, &filters))
                .collect()
        };
        let _ = tx.send(initial);

        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                collection: collection.to_string(),
                filters,
                tx,
            },
        );

        Ok(Subscription {
            id,
            rx,
            registry: Arc::clone(&self.subscribers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let store = MemoryStore::new();
        let id = store
            .create("bookings", json!({"status": "searching", "client_id": "c1"}))
            .await
            .expect("create");
        let doc = store.get("bookings", &id).await.expect("get");
        assert_eq!(doc["status"], "searching");
        assert_eq!(doc["id"], id.as_str());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("bookings", "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn conditional_update_rejects_when_predicate_fails() {
        let store = MemoryStore::new();
        let id = store
            .create("bookings", json!({"status": "accepted"}))
            .await
            .unwrap();
        let applied = store
            .conditional_update(
                "bookings",
                &id,
                &|doc| doc["status"] == "searching",
                json!({"status": "cancelled"}),
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get("bookings", &id).await.unwrap()["status"], "accepted");
    }

    #[tokio::test]
    async fn concurrent_conditional_updates_admit_one_winner() {
        let store = MemoryStore::new();
        let id = store
            .create(
                "bookings",
                json!({"status": "searching", "assigned_worker": null}),
            )
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    store
                        .conditional_update(
                            "bookings",
                            &id,
                            &|doc| doc["assigned_worker"].is_null(),
                            json!({"assigned_worker": format!("w{i}"), "status": "accepted"}),
                        )
                        .await
                        .expect("update")
                })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            if handle.await.expect("join") {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);

        let doc = store.get("bookings", &id).await.unwrap();
        assert!(doc["assigned_worker"].is_string());
        assert_eq!(doc["status"], "accepted");
    }

    #[tokio::test]
    async fn query_applies_filters_and_ordering() {
        let store = MemoryStore::new();
        for (status, at) in [
            ("searching", "2026-03-01T10:00:00Z"),
            ("searching", "2026-03-01T08:00:00Z"),
            ("accepted", "2026-03-01T09:00:00Z"),
        ] {
            store
                .create("bookings", json!({"status": status, "created_at": at}))
                .await
                .unwrap();
        }

        let docs = store
            .query(
                "bookings",
                &[Filter::eq("status", "searching")],
                Some(&OrderBy::asc("created_at")),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["created_at"], "2026-03-01T08:00:00Z");
    }

    #[tokio::test]
    async fn timestamp_filters_compare_chronologically() {
        let store = MemoryStore::new();
        store
            .create(
                "bookings",
                json!({"status": "searching", "auto_cleanup_at": "2026-03-01T10:00:00.250Z"}),
            )
            .await
            .unwrap();

        // Lexicographic comparison would get the fractional-second form wrong.
        let due = store
            .query(
                "bookings",
                &[Filter::le("auto_cleanup_at", "2026-03-01T10:00:01Z")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        let not_due = store
            .query(
                "bookings",
                &[Filter::le("auto_cleanup_at", "2026-03-01T10:00:00Z")],
                None,
            )
            .await
            .unwrap();
        assert!(not_due.is_empty());
    }

    #[tokio::test]
    async fn subscribe_streams_snapshots_until_cancelled() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe("bookings", vec![Filter::eq("status", "searching")])
            .await
            .unwrap();

        let initial = sub.recv().await.expect("initial snapshot");
        assert!(initial.is_empty());

        store
            .create("bookings", json!({"status": "searching"}))
            .await
            .unwrap();
        let snapshot = sub.recv().await.expect("update snapshot");
        assert_eq!(snapshot.len(), 1);

        sub.cancel().await;
        store
            .create("bookings", json!({"status": "searching"}))
            .await
            .unwrap();
        assert!(store.subscribers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let store = MemoryStore::new();
        let id = store
            .create("bookings", json!({"status": "searching"}))
            .await
            .unwrap();
        store.delete("bookings", &id).await.expect("delete");
        assert!(matches!(
            store.get("bookings", &id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("bookings", &id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
