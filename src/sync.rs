//! Reconciles the persisted tag catalog against an authoritative definition list.

use crate::backend::{record_id, without_volatile, Collection, Filter, Query, RecordStore, TAGS};
use crate::error::StoreError;
use crate::telemetry::{store_metrics, StoreEvent, StoreEventListener};
use crate::types::{TagDefinition, TagKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of comparing a persisted record with its authoritative counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Unchanged,
    /// Same keys and shapes, different values. Patched in place.
    ValueChanged,
    /// Keys or value shapes differ. The record is deleted and recreated.
    StructureChanged,
}

/// Compares two records with the backend-maintained fields ignored.
pub fn compare(persisted: &Value, authoritative: &Value) -> Comparison {
    let persisted = without_volatile(persisted.clone());
    let authoritative = without_volatile(authoritative.clone());
    if !same_shape(&persisted, &authoritative) {
        Comparison::StructureChanged
    } else if persisted != authoritative {
        Comparison::ValueChanged
    } else {
        Comparison::Unchanged
    }
}

fn same_shape(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| same_shape(v, w)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| same_shape(v, w))
        }
        (Value::Null, Value::Null)
        | (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_)) => true,
        _ => false,
    }
}

/// Which persisted tags a pass may delete as orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The authoritative list covers the whole catalog.
    #[default]
    Local,
    /// The list covers only some objects; only tags owned by those objects are eligible.
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Persisted tags after the pass.
    pub total: u64,
}

impl SyncReport {
    pub fn changes(&self) -> u64 {
        self.added + self.updated + self.deleted
    }
}

#[derive(Debug, Clone)]
pub struct TagDefinitionSynchronizer {
    tags: Collection<TagDefinition>,
    events: Arc<dyn StoreEventListener>,
}

impl TagDefinitionSynchronizer {
    pub fn new(store: Arc<dyn RecordStore>, events: Arc<dyn StoreEventListener>) -> Self {
        TagDefinitionSynchronizer {
            tags: Collection::new(store, TAGS),
            events,
        }
    }

    /// Runs one synchronization pass.
    ///
    /// Every definition is validated (group flag, retention policy) before anything is written. Duplicate keys in
    /// `definitions` resolve to the last occurrence.
    pub async fn sync(
        &self,
        definitions: &[TagDefinition],
        mode: SyncMode,
    ) -> Result<SyncReport, StoreError> {
        for def in definitions {
            def.validate()?;
        }

        let mut position: HashMap<&str, usize> = HashMap::new();
        let mut authoritative: Vec<&TagDefinition> = Vec::with_capacity(definitions.len());
        for def in definitions {
            match position.get(def.key.as_str()) {
                Some(&i) => authoritative[i] = def,
                None => {
                    position.insert(def.key.as_str(), authoritative.len());
                    authoritative.push(def);
                }
            }
        }

        let persisted: HashMap<String, Value> = self
            .tags
            .find_raw(&Query::all().oldest_first())
            .await?
            .into_iter()
            .filter_map(|raw| {
                let key = raw.get("key")?.as_str()?.to_string();
                Some((key, raw))
            })
            .collect();

        let mut report = SyncReport::default();
        for def in &authoritative {
            let mut wanted = (*def).clone();
            wanted.id = None;
            let wanted_raw = without_volatile(serde_json::to_value(&wanted)?);

            let Some(existing) = persisted.get(&def.key) else {
                self.tags.create(&wanted).await?;
                report.added += 1;
                self.events.on_event(StoreEvent::TagCreated {
                    key: def.key.clone(),
                });
                continue;
            };

            match compare(existing, &wanted_raw) {
                Comparison::Unchanged => {}
                Comparison::ValueChanged => {
                    self.tags.patch(&record_id(existing)?, wanted_raw).await?;
                    report.updated += 1;
                    self.events.on_event(StoreEvent::TagPatched {
                        key: def.key.clone(),
                    });
                }
                Comparison::StructureChanged => {
                    self.tags.remove_id(&record_id(existing)?).await?;
                    self.tags.create(&wanted).await?;
                    report.deleted += 1;
                    report.added += 1;
                    self.events.on_event(StoreEvent::TagRecreated {
                        key: def.key.clone(),
                    });
                }
            }
        }

        let wanted_keys: HashSet<&str> = position.keys().copied().collect();
        let scope: HashSet<&str> = authoritative
            .iter()
            .filter(|d| d.kind == TagKind::Object)
            .map(|d| d.key.as_str())
            .collect();
        for (key, raw) in &persisted {
            if wanted_keys.contains(key.as_str()) {
                continue;
            }
            if mode == SyncMode::Remote {
                let owner = raw.get("ownerName").and_then(Value::as_str);
                if !owner.map_or(false, |o| scope.contains(o)) {
                    continue;
                }
            }
            self.tags.remove_id(&record_id(raw)?).await?;
            report.deleted += 1;
            self.events.on_event(StoreEvent::TagRemoved {
                key: key.clone(),
                reason: "absent from authoritative definitions",
            });
        }

        report.total = self.tags.count(&Filter::new()).await?;
        tracing::debug!(?mode, ?report, "sync pass finished");
        store_metrics::record_tags_synced(report.changes());
        self.events.on_event(StoreEvent::SyncCompleted {
            added: report.added,
            updated: report.updated,
            deleted: report.deleted,
            total: report.total,
        });
        Ok(report)
    }
}
