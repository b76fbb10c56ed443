//! Windowed value storage: maps incoming samples onto time-bounded value documents.
//!
//! A sample for tag `T` at key `K` lands in the first existing document of `T` whose
//! `[bucketStart, bucketEnd]` lies inside the `[n, unit]` window containing `K`. Otherwise a
//! new document is started. Entries are upserted by key, so replaying a sample is harmless.
//!
//! The find-then-write sequence is not atomic. Callers must serialize writes per tag, see
//! [`crate::queue::UpdateSerializationQueue`].

use crate::backend::{Collection, Filter, Query, RecordStore, TAGS, VALUES};
use crate::error::StoreError;
use crate::retention::RetentionEnforcer;
use crate::telemetry::store_metrics;
use crate::types::{
    Entry, FlatSample, GroupSample, Notification, Sample, TagDefinition, TagKind, ValueDocument,
};
use crate::window::{compare_keys, parse_key, BucketSize, Window};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WindowedValueStore {
    tags: Collection<TagDefinition>,
    documents: Collection<ValueDocument>,
    retention: RetentionEnforcer,
    default_bucket: BucketSize,
}

impl WindowedValueStore {
    pub fn new(
        store: Arc<dyn RecordStore>,
        retention: RetentionEnforcer,
        default_bucket: BucketSize,
    ) -> Self {
        WindowedValueStore {
            tags: Collection::new(Arc::clone(&store), TAGS),
            documents: Collection::new(store, VALUES),
            retention,
            default_bucket,
        }
    }

    async fn tag(&self, name: &str) -> Result<TagDefinition, StoreError> {
        self.tags
            .find_one(Filter::new().eq("key", name))
            .await?
            .ok_or_else(|| StoreError::not_found("tag", name))
    }

    /// Queue under which a notification must be serialized. Samples sent directly to a group
    /// member share the queue of its group owner, so they never race a group sample over the
    /// same documents. An unknown tag keeps its own name and is rejected when applied.
    pub async fn serialization_key(
        &self,
        notification: &Notification,
    ) -> Result<String, StoreError> {
        let Notification::Value(sample) = notification else {
            return Ok(notification.source().to_string());
        };
        match self.tag(&sample.tag).await {
            Ok(tag) if tag.kind == TagKind::GroupMember => {
                Ok(tag.owner_group.unwrap_or(tag.key))
            }
            Ok(tag) => Ok(tag.key),
            Err(StoreError::NotFound { .. }) => Ok(sample.tag.clone()),
            Err(e) => Err(e),
        }
    }

    /// Applies one notification. Returns the documents written.
    pub async fn apply(
        &self,
        notification: &Notification,
    ) -> Result<Vec<ValueDocument>, StoreError> {
        match notification {
            Notification::Value(sample) => Ok(vec![self.write(sample).await?]),
            Notification::Group(group) => self.write_group(group).await,
        }
    }

    /// Upserts a scalar or array sample into its bucket.
    pub async fn write(&self, sample: &Sample) -> Result<ValueDocument, StoreError> {
        if sample.value.is_object() {
            return Err(StoreError::Validation(format!(
                "tag {}: object values must be sent as group samples",
                sample.tag
            )));
        }
        let tag = self.tag(&sample.tag).await?;
        if tag.is_group_owner() {
            return Err(StoreError::Validation(format!(
                "tag {} is a group; write its members through a group sample",
                tag.key
            )));
        }
        if !tag.kind.holds_values() {
            return Err(StoreError::Validation(format!(
                "tag {} is {:?} and holds no values",
                tag.key, tag.kind
            )));
        }
        self.write_entry(
            &tag,
            Entry {
                key: sample.key.clone(),
                value: sample.value.clone(),
                envelope: sample.envelope.clone(),
            },
        )
        .await
    }

    /// Fans a group sample out to its members, one upsert per member present in the payload.
    ///
    /// Every member name is checked against the catalog before anything is written.
    pub async fn write_group(
        &self,
        sample: &GroupSample,
    ) -> Result<Vec<ValueDocument>, StoreError> {
        let group = self.tag(&sample.group).await?;
        if !group.is_group_owner() {
            return Err(StoreError::Validation(format!(
                "tag {} is not a group",
                group.key
            )));
        }
        let members: HashMap<String, TagDefinition> = self
            .tags
            .find(&Query::filtered(
                Filter::new().eq("ownerGroup", group.key.as_str()),
            ))
            .await?
            .into_iter()
            .filter(|t| t.kind == TagKind::GroupMember)
            .map(|t| (t.key.clone(), t))
            .collect();

        let mut targets = Vec::with_capacity(sample.members.len());
        for (name, value) in &sample.members {
            let member = members
                .get(name)
                .ok_or_else(|| StoreError::not_found("group member", format!("{}/{}", group.key, name)))?;
            targets.push((member, value));
        }

        let mut written = Vec::with_capacity(targets.len());
        for (member, value) in targets {
            let entry = Entry {
                key: sample.key.clone(),
                value: value.clone(),
                envelope: sample.envelope.clone(),
            };
            written.push(self.write_entry(member, entry).await?);
        }
        Ok(written)
    }

    async fn write_entry(
        &self,
        tag: &TagDefinition,
        entry: Entry,
    ) -> Result<ValueDocument, StoreError> {
        let policy = tag.retention()?;
        let bucket = policy.bucket_size.unwrap_or(self.default_bucket);
        let window = bucket.window_containing(parse_key(&entry.key)?)?;

        let existing = self.documents(&tag.key).await?;
        let stored = match existing.into_iter().find(|doc| bucket_fits(doc, &window)) {
            Some(mut doc) => {
                let id = doc.id.clone().ok_or_else(|| {
                    StoreError::Backend(format!("value document of {} without _id", tag.key))
                })?;
                doc.upsert(entry);
                let mut fields = Map::new();
                fields.insert("entries".to_string(), serde_json::to_value(&doc.entries)?);
                fields.insert("bucketStart".to_string(), Value::from(doc.bucket_start));
                fields.insert("bucketEnd".to_string(), Value::from(doc.bucket_end));
                self.documents.patch(&id, Value::Object(fields)).await?
            }
            None => {
                self.documents
                    .create(&ValueDocument::first(tag, entry))
                    .await?
            }
        };
        tracing::trace!(tag = %tag.key, bucket = %bucket, start = %stored.bucket_start, end = %stored.bucket_end, "sample stored");
        store_metrics::record_samples_written(1);

        self.retention
            .enforce(
                VALUES,
                "tagName",
                &tag.key,
                policy.max_documents.map(|m| m.count()),
            )
            .await?;
        Ok(stored)
    }

    /// All documents of a tag in creation order.
    pub async fn documents(&self, tag: &str) -> Result<Vec<ValueDocument>, StoreError> {
        self.documents
            .find(&Query::filtered(Filter::new().eq("tagName", tag)).oldest_first())
            .await
    }

    /// The document whose range covers `key`, if any.
    pub async fn bucket_for(
        &self,
        tag: &str,
        key: &str,
    ) -> Result<Option<ValueDocument>, StoreError> {
        let at = parse_key(key)?;
        Ok(self.documents(tag).await?.into_iter().find(|doc| {
            match (parse_key(&doc.bucket_start), parse_key(&doc.bucket_end)) {
                (Ok(start), Ok(end)) => start <= at && at <= end,
                _ => false,
            }
        }))
    }

    /// Full history of a tag, one sample per timestamp. For a group, every member's
    /// documents are merged so each timestamp carries all member values.
    pub async fn history(&self, tag: &str) -> Result<Vec<FlatSample>, StoreError> {
        let tag = self.tag(tag).await?;
        let docs = if tag.is_group_owner() {
            let members: Vec<String> = self
                .tags
                .find(&Query::filtered(
                    Filter::new().eq("ownerGroup", tag.key.as_str()),
                ))
                .await?
                .into_iter()
                .map(|t| t.key)
                .collect();
            self.documents
                .find(&Query::filtered(Filter::new().is_in("tagName", members)).oldest_first())
                .await?
        } else {
            self.documents(&tag.key).await?
        };
        Ok(flatten(&docs))
    }
}

/// Containment of the existing bucket inside the new window (not mere overlap with the key).
fn bucket_fits(doc: &ValueDocument, window: &Window) -> bool {
    match (parse_key(&doc.bucket_start), parse_key(&doc.bucket_end)) {
        (Ok(start), Ok(end)) => window.encloses(start, end),
        _ => false,
    }
}

/// Flattens documents into one [`FlatSample`] per timestamp, ascending. Values are keyed by
/// the owning tag name.
pub fn flatten(documents: &[ValueDocument]) -> Vec<FlatSample> {
    let mut by_key: HashMap<&str, FlatSample> = HashMap::new();
    for doc in documents {
        for entry in &doc.entries {
            let flat = by_key.entry(entry.key.as_str()).or_insert_with(|| FlatSample {
                key: entry.key.clone(),
                values: Default::default(),
                envelope: None,
            });
            flat.values.insert(doc.tag_name.clone(), entry.value.clone());
            if flat.envelope.is_none() {
                flat.envelope = entry.envelope.clone();
            }
        }
    }
    let mut out: Vec<FlatSample> = by_key.into_values().collect();
    out.sort_by(|a, b| compare_keys(&a.key, &b.key));
    out
}
