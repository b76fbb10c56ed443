//! Record-store contract: the five operations the core needs from a persistence backend,
//! plus a typed per-collection view.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

/// Collection holding the tag catalog.
pub const TAGS: &str = "tags";
/// Collection holding value documents.
pub const VALUES: &str = "values";
/// Append-only diagnostic log.
pub const DIAGNOSTICS: &str = "diagnostics";

pub const ID_FIELD: &str = "_id";
/// Monotonic creation sequence; ascending order is creation order.
pub const SEQ_FIELD: &str = "_seq";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const REVISION_FIELD: &str = "__v";

/// Fields maintained by the backend rather than by the record's author.
pub const VOLATILE_FIELDS: [&str; 5] = [
    ID_FIELD,
    SEQ_FIELD,
    CREATED_AT_FIELD,
    UPDATED_AT_FIELD,
    REVISION_FIELD,
];

/// Predicate on one field. A missing field reads as `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
}

impl Condition {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            Condition::Eq(v) => actual == v,
            Condition::Ne(v) => actual != v,
            Condition::In(vs) => vs.contains(actual),
            Condition::NotIn(vs) => !vs.contains(actual),
        }
    }
}

/// Conjunction of field conditions. The empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, condition: Condition) -> Self {
        self.conditions.push((field.to_string(), condition));
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn is_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(field, Condition::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(
            field,
            Condition::NotIn(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|(field, cond)| {
            cond.matches(record.get(field.as_str()).unwrap_or(&Value::Null))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// Filter plus optional single-field sort and result limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Query {
            filter,
            ..Self::default()
        }
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some(Sort {
            field: field.to_string(),
            order,
        });
        self
    }

    /// Sorts by creation order, oldest first.
    pub fn oldest_first(self) -> Self {
        self.sort_by(SEQ_FIELD, SortOrder::Ascending)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Target of a removal.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveTarget {
    Id(String),
    Filter(Filter),
}

/// Generic record store exposed per named collection.
///
/// Records are JSON objects. Implementations maintain the [`VOLATILE_FIELDS`]: `create`
/// assigns `_id`, `_seq`, `createdAt`, `updatedAt` and `__v = 0`; `patch` merges top-level
/// fields, refreshes `updatedAt` and increments `__v`. Removing an unknown id is
/// [`StoreError::NotFound`].
#[async_trait]
pub trait RecordStore: std::fmt::Debug + Send + Sync + 'static {
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    async fn find(&self, collection: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    async fn create(&self, collection: &str, record: Value) -> Result<Value, StoreError>;

    async fn patch(&self, collection: &str, id: &str, partial: Value)
        -> Result<Value, StoreError>;

    /// Removes the targeted records and returns them.
    async fn remove(&self, collection: &str, target: RemoveTarget)
        -> Result<Vec<Value>, StoreError>;
}

/// Total order over JSON values used for sorting: null < bool < number < string < other.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Strips backend-maintained fields from a record.
pub fn without_volatile(mut record: Value) -> Value {
    if let Some(obj) = record.as_object_mut() {
        for field in VOLATILE_FIELDS {
            obj.remove(field);
        }
    }
    record
}

pub(crate) fn record_id(record: &Value) -> Result<String, StoreError> {
    record
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Backend("record without _id".to_string()))
}

/// Typed view over one named collection of a [`RecordStore`].
pub struct Collection<T> {
    store: Arc<dyn RecordStore>,
    name: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Collection {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn RecordStore>, name: &str) -> Self {
        Collection {
            store,
            name: name.to_string(),
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.store.count(&self.name, filter).await
    }

    pub async fn find(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        self.find_raw(query)
            .await?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(StoreError::from))
            .collect()
    }

    pub async fn find_raw(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        self.store.find(&self.name, query).await
    }

    pub async fn find_one(&self, filter: Filter) -> Result<Option<T>, StoreError> {
        Ok(self
            .find(&Query::filtered(filter).oldest_first().limit(1))
            .await?
            .pop())
    }

    pub async fn create(&self, record: &T) -> Result<T, StoreError> {
        let raw = without_volatile(serde_json::to_value(record)?);
        let stored = self.store.create(&self.name, raw).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn patch(&self, id: &str, partial: Value) -> Result<T, StoreError> {
        let stored = self.store.patch(&self.name, id, partial).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn remove_id(&self, id: &str) -> Result<usize, StoreError> {
        let removed = self
            .store
            .remove(&self.name, RemoveTarget::Id(id.to_string()))
            .await?;
        Ok(removed.len())
    }

    pub async fn remove(&self, filter: Filter) -> Result<usize, StoreError> {
        let removed = self
            .store
            .remove(&self.name, RemoveTarget::Filter(filter))
            .await?;
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_semantics() {
        let rec = json!({"key": "a", "kind": "variable", "ownerName": "Obj"});
        assert!(Filter::new().matches(&rec));
        assert!(Filter::new().eq("key", "a").ne("kind", "object").matches(&rec));
        assert!(Filter::new().is_in("ownerName", ["Obj", "Other"]).matches(&rec));
        assert!(!Filter::new().not_in("ownerName", ["Obj"]).matches(&rec));
        // Missing fields read as null.
        assert!(Filter::new().eq("ownerGroup", Value::Null).matches(&rec));
        assert!(Filter::new().not_in("ownerGroup", ["G"]).matches(&rec));
        assert!(!Filter::new().is_in("ownerGroup", ["G"]).matches(&rec));
    }

    #[test]
    fn test_compare_json_orders_numbers_numerically() {
        assert_eq!(compare_json(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_json(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_json(&Value::Null, &json!("x")), Ordering::Less);
        assert_eq!(compare_json(&json!("b"), &json!("a")), Ordering::Greater);
    }

    #[test]
    fn test_without_volatile() {
        let rec = json!({"_id": "x", "_seq": 3, "createdAt": "t", "updatedAt": "t", "__v": 2, "key": "k"});
        assert_eq!(without_volatile(rec), json!({"key": "k"}));
    }
}
