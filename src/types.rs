use crate::error::StoreError;
use crate::window::{compare_keys, BucketSize};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Role of a tag in the monitored namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagKind {
    Object,
    Variable,
    Method,
    GroupOwner,
    GroupMember,
}

impl TagKind {
    /// Tags of this kind own value documents.
    pub fn holds_values(self) -> bool {
        !matches!(self, TagKind::Object | TagKind::Method)
    }

    /// Counts as a child variable of its owner object.
    pub fn is_variable_like(self) -> bool {
        matches!(
            self,
            TagKind::Variable | TagKind::GroupOwner | TagKind::GroupMember
        )
    }
}

/// A catalog entry, identified by its unique `key`.
///
/// Attributes not modeled here are preserved in `attributes` and take part in catalog
/// comparisons like any other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDefinition {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: String,
    pub kind: TagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_group: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    /// Kept raw so a malformed policy surfaces as a validation error when it is used rather
    /// than as a decode failure of the whole catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<Value>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl TagDefinition {
    fn bare(key: &str, kind: TagKind) -> Self {
        TagDefinition {
            id: None,
            key: key.to_string(),
            kind,
            owner_name: None,
            owner_group: None,
            is_group: false,
            retention_policy: None,
            attributes: Map::new(),
        }
    }

    pub fn object(key: &str) -> Self {
        Self::bare(key, TagKind::Object)
    }

    pub fn variable(key: &str, owner: &str) -> Self {
        let mut tag = Self::bare(key, TagKind::Variable);
        tag.owner_name = Some(owner.to_string());
        tag
    }

    pub fn method(key: &str, owner: &str) -> Self {
        let mut tag = Self::bare(key, TagKind::Method);
        tag.owner_name = Some(owner.to_string());
        tag
    }

    pub fn group_owner(key: &str, owner: &str) -> Self {
        let mut tag = Self::bare(key, TagKind::GroupOwner);
        tag.owner_name = Some(owner.to_string());
        tag.is_group = true;
        tag
    }

    pub fn group_member(key: &str, owner: &str, group: &str) -> Self {
        let mut tag = Self::bare(key, TagKind::GroupMember);
        tag.owner_name = Some(owner.to_string());
        tag.owner_group = Some(group.to_string());
        tag
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = serde_json::to_value(policy).ok();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Group owners are identified by kind; `isGroup` must agree with it.
    pub fn is_group_owner(&self) -> bool {
        self.kind == TagKind::GroupOwner
    }

    /// Checks the definition as a whole before it enters the catalog: a consistent group
    /// flag and a well-formed retention policy.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.is_group != self.is_group_owner() {
            return Err(StoreError::Validation(format!(
                "tag {}: isGroup is {} but kind is {:?}",
                self.key, self.is_group, self.kind
            )));
        }
        self.retention().map(|_| ())
    }

    /// Parses and validates this tag's retention policy. A tag without one gets the empty
    /// policy (configured defaults apply).
    pub fn retention(&self) -> Result<RetentionPolicy, StoreError> {
        let Some(raw) = &self.retention_policy else {
            return Ok(RetentionPolicy::default());
        };
        let policy: RetentionPolicy = serde_json::from_value(raw.clone()).map_err(|e| {
            StoreError::Validation(format!("tag {}: malformed retention policy: {}", self.key, e))
        })?;
        policy
            .validate()
            .map_err(|e| StoreError::Validation(format!("tag {}: {}", self.key, e)))?;
        Ok(policy)
    }
}

/// Per-tag storage limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<BucketSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_documents: Option<DocumentLimit>,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(bucket) = &self.bucket_size {
            bucket.validate()?;
        }
        Ok(())
    }
}

/// Maximum number of value documents, either a bare count or `[n, "documents"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentLimit {
    Count(u64),
    Counted(u64, CountUnit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountUnit {
    #[serde(alias = "document", alias = "docs")]
    Documents,
}

impl DocumentLimit {
    pub fn count(&self) -> u64 {
        match *self {
            DocumentLimit::Count(n) | DocumentLimit::Counted(n, _) => n,
        }
    }
}

/// One time-keyed sample inside a value document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

/// A persisted bucket of samples for one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueDocument {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<String>,
    pub tag_name: String,
    pub bucket_start: String,
    pub bucket_end: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl ValueDocument {
    /// Starts a bucket holding a single entry.
    pub fn first(tag: &TagDefinition, entry: Entry) -> Self {
        ValueDocument {
            id: None,
            tag_id: tag.id.clone(),
            tag_name: tag.key.clone(),
            bucket_start: entry.key.clone(),
            bucket_end: entry.key.clone(),
            entries: vec![entry],
        }
    }

    /// Replaces any entry with the same key, keeps entries sorted and re-derives the bounds.
    pub fn upsert(&mut self, entry: Entry) {
        self.entries.retain(|e| e.key != entry.key);
        self.entries.push(entry);
        self.entries.sort_by(|a, b| compare_keys(&a.key, &b.key));
        if let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) {
            self.bucket_start = first.key.clone();
            self.bucket_end = last.key.clone();
        }
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

/// A decoded scalar or array sample for one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub tag: String,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

impl Sample {
    pub fn new(tag: &str, key: &str, value: Value) -> Self {
        Sample {
            tag: tag.to_string(),
            key: key.to_string(),
            value,
            envelope: None,
        }
    }
}

/// One composite sample for a group owner: a shared timestamp plus named member values.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSample {
    pub group: String,
    pub key: String,
    pub envelope: Option<Value>,
    pub members: BTreeMap<String, Value>,
}

impl GroupSample {
    /// Decodes `{"timestamp": .., "envelope": {..}?, "<member>": <value>, ..}`.
    pub fn from_payload(group: &str, payload: &Value) -> Result<Self, StoreError> {
        let Some(obj) = payload.as_object() else {
            return Err(StoreError::Validation(format!(
                "group {}: payload must be an object",
                group
            )));
        };
        let key = obj
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreError::Validation(format!("group {}: payload has no timestamp", group))
            })?
            .to_string();
        let envelope = obj.get("envelope").cloned();
        let members = obj
            .iter()
            .filter(|(name, _)| name.as_str() != "timestamp" && name.as_str() != "envelope")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(GroupSample {
            group: group.to_string(),
            key,
            envelope,
            members,
        })
    }
}

/// A "value changed" notification as delivered by the subscription layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Value(Sample),
    Group(GroupSample),
}

impl Notification {
    /// Logical source used to serialize processing.
    pub fn source(&self) -> &str {
        match self {
            Notification::Value(s) => &s.tag,
            Notification::Group(g) => &g.group,
        }
    }

    /// Decodes `{"tag", "key", "value", "envelope"?}` or `{"tag", "group": {..}}`.
    pub fn from_json(raw: &Value) -> Result<Self, StoreError> {
        let tag = raw
            .get("tag")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Validation("notification has no tag".to_string()))?;
        if let Some(payload) = raw.get("group") {
            return Ok(Notification::Group(GroupSample::from_payload(tag, payload)?));
        }
        let sample: Sample = serde_json::from_value(raw.clone())
            .map_err(|e| StoreError::Validation(format!("tag {}: bad sample: {}", tag, e)))?;
        Ok(Notification::Value(sample))
    }
}

/// One timestamp of a tag's history with every member value recorded at it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatSample {
    pub key: String,
    pub values: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}
