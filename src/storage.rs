use crate::backend::{
    compare_json, Filter, Query, RecordStore, RemoveTarget, SortOrder, CREATED_AT_FIELD, ID_FIELD,
    REVISION_FIELD, SEQ_FIELD, UPDATED_AT_FIELD, VOLATILE_FIELDS,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time copy of every collection, used for snapshots and recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreImage {
    /// Next `_seq` to hand out.
    pub next_seq: u64,
    pub collections: BTreeMap<String, Vec<Value>>,
}

/// In-process record store.
///
/// Each collection is a vector of JSON records in creation order. Uses an RwLock so
/// concurrent finds share access while create/patch/remove take it exclusively. Every
/// operation yields to the scheduler first, so callers see a real suspension point just as
/// with a networked backend.
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    next_seq: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            collections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from an image (recovery path).
    pub fn from_image(image: StoreImage) -> Self {
        let max_seq = image
            .collections
            .values()
            .flatten()
            .filter_map(|r| r.get(SEQ_FIELD).and_then(Value::as_u64))
            .max()
            .unwrap_or(0);
        MemoryStore {
            collections: RwLock::new(image.collections.into_iter().collect()),
            next_seq: AtomicU64::new(image.next_seq.max(max_seq + 1)),
        }
    }

    /// Copies out every collection.
    pub fn image(&self) -> Result<StoreImage, StoreError> {
        let guard = self.collections.read()?;
        Ok(StoreImage {
            next_seq: self.next_seq.load(Ordering::SeqCst),
            collections: guard
                .iter()
                .map(|(name, records)| (name.clone(), records.clone()))
                .collect(),
        })
    }

    /// Number of records across all collections.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.collections.read()?.values().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn has_id(record: &Value, id: &str) -> bool {
    record.get(ID_FIELD).and_then(Value::as_str) == Some(id)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        let guard = self.collections.read()?;
        let n = guard
            .get(collection)
            .map(|records| records.iter().filter(|r| filter.matches(r)).count())
            .unwrap_or(0);
        Ok(n as u64)
    }

    async fn find(&self, collection: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        tokio::task::yield_now().await;
        let guard = self.collections.read()?;
        let mut out: Vec<Value> = guard
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| query.filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(guard);

        if let Some(sort) = &query.sort {
            // Stable: ties keep creation order.
            out.sort_by(|a, b| {
                let ord = compare_json(
                    a.get(sort.field.as_str()).unwrap_or(&Value::Null),
                    b.get(sort.field.as_str()).unwrap_or(&Value::Null),
                );
                match sort.order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn create(&self, collection: &str, record: Value) -> Result<Value, StoreError> {
        tokio::task::yield_now().await;
        let Value::Object(mut obj) = record else {
            return Err(StoreError::Backend(format!(
                "{}: records must be JSON objects",
                collection
            )));
        };
        let now = now_rfc3339();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        obj.insert(ID_FIELD.to_string(), Value::from(uuid::Uuid::new_v4().to_string()));
        obj.insert(SEQ_FIELD.to_string(), Value::from(seq));
        obj.insert(CREATED_AT_FIELD.to_string(), Value::from(now.clone()));
        obj.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));
        obj.insert(REVISION_FIELD.to_string(), Value::from(0u64));
        let stored = Value::Object(obj);

        let mut guard = self.collections.write()?;
        guard
            .entry(collection.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<Value, StoreError> {
        tokio::task::yield_now().await;
        let Value::Object(fields) = partial else {
            return Err(StoreError::Backend(format!(
                "{}: patch payload must be a JSON object",
                collection
            )));
        };
        let mut guard = self.collections.write()?;
        let record = guard
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| has_id(r, id)))
            .ok_or_else(|| StoreError::not_found("record", format!("{}/{}", collection, id)))?;
        let obj = record
            .as_object_mut()
            .ok_or_else(|| StoreError::Corruption {
                details: format!("{}/{} is not an object", collection, id),
            })?;

        for (field, value) in fields {
            if !VOLATILE_FIELDS.contains(&field.as_str()) {
                obj.insert(field, value);
            }
        }
        let revision = obj.get(REVISION_FIELD).and_then(Value::as_u64).unwrap_or(0) + 1;
        obj.insert(REVISION_FIELD.to_string(), Value::from(revision));
        obj.insert(UPDATED_AT_FIELD.to_string(), Value::from(now_rfc3339()));
        Ok(record.clone())
    }

    async fn remove(
        &self,
        collection: &str,
        target: RemoveTarget,
    ) -> Result<Vec<Value>, StoreError> {
        tokio::task::yield_now().await;
        let mut guard = self.collections.write()?;
        let records = guard.entry(collection.to_string()).or_default();
        let (removed, kept): (Vec<Value>, Vec<Value>) = match &target {
            RemoveTarget::Id(id) => std::mem::take(records)
                .into_iter()
                .partition(|r| has_id(r, id)),
            RemoveTarget::Filter(filter) => std::mem::take(records)
                .into_iter()
                .partition(|r| filter.matches(r)),
        };
        *records = kept;

        if let RemoveTarget::Id(id) = target {
            if removed.is_empty() {
                return Err(StoreError::not_found(
                    "record",
                    format!("{}/{}", collection, id),
                ));
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Query;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_volatile_fields() {
        let store = MemoryStore::new();
        let a = store.create("c", json!({"k": 1})).await.unwrap();
        let b = store.create("c", json!({"k": 2})).await.unwrap();
        assert!(a.get(ID_FIELD).and_then(Value::as_str).is_some());
        assert_ne!(a[ID_FIELD], b[ID_FIELD]);
        assert!(a[SEQ_FIELD].as_u64().unwrap() < b[SEQ_FIELD].as_u64().unwrap());
        assert_eq!(a[REVISION_FIELD], json!(0));
        assert!(store.create("c", json!([1, 2])).await.is_err());
    }

    #[tokio::test]
    async fn test_find_sort_and_limit() {
        let store = MemoryStore::new();
        for k in [3, 1, 2] {
            store.create("c", json!({"k": k})).await.unwrap();
        }
        let asc = store
            .find("c", &Query::all().sort_by("k", SortOrder::Ascending))
            .await
            .unwrap();
        assert_eq!(asc.iter().map(|r| r["k"].as_i64().unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);

        let newest = store
            .find("c", &Query::all().sort_by(SEQ_FIELD, SortOrder::Descending).limit(1))
            .await
            .unwrap();
        assert_eq!(newest[0]["k"], json!(2));
        assert!(store.find("missing", &Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_patch_merges_and_bumps_revision() {
        let store = MemoryStore::new();
        let rec = store.create("c", json!({"k": 1, "x": "a"})).await.unwrap();
        let id = rec[ID_FIELD].as_str().unwrap().to_string();
        let patched = store
            .patch("c", &id, json!({"x": "b", "_seq": 999}))
            .await
            .unwrap();
        assert_eq!(patched["x"], json!("b"));
        assert_eq!(patched["k"], json!(1));
        assert_eq!(patched[REVISION_FIELD], json!(1));
        assert_eq!(patched[SEQ_FIELD], rec[SEQ_FIELD]);

        let err = store.patch("c", "nope", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_by_id_and_filter() {
        let store = MemoryStore::new();
        let a = store.create("c", json!({"k": "a"})).await.unwrap();
        store.create("c", json!({"k": "b"})).await.unwrap();
        store.create("c", json!({"k": "c"})).await.unwrap();

        let id = a[ID_FIELD].as_str().unwrap().to_string();
        assert_eq!(store.remove("c", RemoveTarget::Id(id.clone())).await.unwrap().len(), 1);
        assert!(matches!(
            store.remove("c", RemoveTarget::Id(id)).await,
            Err(StoreError::NotFound { .. })
        ));

        let removed = store
            .remove("c", RemoveTarget::Filter(Filter::new().ne("k", "b")))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.count("c", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_image_round_trip_keeps_sequence() {
        let store = MemoryStore::new();
        store.create("c", json!({"k": 1})).await.unwrap();
        let image = store.image().unwrap();
        let restored = MemoryStore::from_image(image.clone());
        assert_eq!(restored.image().unwrap(), image);
        let next = restored.create("c", json!({"k": 2})).await.unwrap();
        assert_eq!(next[SEQ_FIELD], json!(image.next_seq));
    }
}
