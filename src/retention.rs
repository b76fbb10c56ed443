//! Documents-per-key retention and the capped diagnostic log built on it.

use crate::backend::{
    Collection, Filter, Query, RecordStore, RemoveTarget, DIAGNOSTICS, ID_FIELD,
};
use crate::error::StoreError;
use crate::telemetry::{store_metrics, StoreEvent, StoreEventListener};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Bounds the number of records sharing an owner key in a collection.
///
/// Oldest records (by creation order) go first. A limit of 0 disables enforcement.
#[derive(Debug, Clone)]
pub struct RetentionEnforcer {
    store: Arc<dyn RecordStore>,
    default_max: u64,
    events: Arc<dyn StoreEventListener>,
}

impl RetentionEnforcer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        default_max: u64,
        events: Arc<dyn StoreEventListener>,
    ) -> Self {
        RetentionEnforcer {
            store,
            default_max,
            events,
        }
    }

    pub fn default_max(&self) -> u64 {
        self.default_max
    }

    /// Deletes the oldest records of `owner` in `collection` beyond `max` (or the default
    /// when `max` is `None`). Returns the number removed.
    pub async fn enforce(
        &self,
        collection: &str,
        owner_field: &str,
        owner: &str,
        max: Option<u64>,
    ) -> Result<u64, StoreError> {
        let max = max.unwrap_or(self.default_max);
        if max == 0 {
            return Ok(0);
        }
        let filter = Filter::new().eq(owner_field, owner);
        let count = self.store.count(collection, &filter).await?;
        if count <= max {
            return Ok(0);
        }
        let excess = count - max;
        let oldest = self
            .store
            .find(
                collection,
                &Query::filtered(filter).oldest_first().limit(excess as usize),
            )
            .await?;
        let ids: Vec<Value> = oldest
            .iter()
            .filter_map(|r| r.get(ID_FIELD).cloned())
            .collect();
        let removed = self
            .store
            .remove(
                collection,
                RemoveTarget::Filter(Filter::new().is_in(ID_FIELD, ids)),
            )
            .await?
            .len() as u64;

        tracing::debug!(collection, owner, count, max, removed, "retention enforced");
        store_metrics::record_documents_pruned(removed);
        self.events.on_event(StoreEvent::RetentionPruned {
            collection: collection.to_string(),
            owner: owner.to_string(),
            removed,
        });
        Ok(removed)
    }
}

/// One diagnostic log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub message: String,
    pub logged_at: String,
}

/// Append-only diagnostic log capped per source.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    records: Collection<DiagnosticRecord>,
    retention: RetentionEnforcer,
    max_per_source: u64,
}

impl DiagnosticLog {
    pub fn new(retention: RetentionEnforcer, max_per_source: u64) -> Self {
        DiagnosticLog {
            records: Collection::new(Arc::clone(&retention.store), DIAGNOSTICS),
            retention,
            max_per_source,
        }
    }

    pub async fn append(&self, source: &str, message: &str) -> Result<(), StoreError> {
        self.records
            .create(&DiagnosticRecord {
                id: None,
                source: source.to_string(),
                message: message.to_string(),
                logged_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .await?;
        self.retention
            .enforce(DIAGNOSTICS, "source", source, Some(self.max_per_source))
            .await?;
        Ok(())
    }

    /// Records for `source`, oldest first.
    pub async fn entries(&self, source: &str) -> Result<Vec<DiagnosticRecord>, StoreError> {
        self.records
            .find(&Query::filtered(Filter::new().eq("source", source)).oldest_first())
            .await
    }
}
