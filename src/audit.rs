//! Referential-integrity repair across the object → variable → group → member hierarchy.
//!
//! Passes run in [`AuditPass::ORDER`] and each one reloads the catalog, so a removal in an
//! earlier pass cascades into later passes of the same run. Nothing cascades backwards: an
//! object emptied by pass 4 is removed by the next run.

use crate::backend::{Collection, Query, RecordStore, TAGS, VALUES};
use crate::error::StoreError;
use crate::telemetry::{store_metrics, StoreEvent, StoreEventListener};
use crate::types::{TagDefinition, TagKind, ValueDocument};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuditPass {
    /// Objects without variable-like children.
    EmptyObjects,
    /// Owned tags whose owner object is gone.
    OrphanVariables,
    /// Group owners without members.
    EmptyGroups,
    /// Group members whose group owner is gone.
    OrphanMembers,
    /// Value documents whose tag is gone. Local scope only.
    OrphanDocuments,
}

impl AuditPass {
    pub const ORDER: [AuditPass; 5] = [
        AuditPass::EmptyObjects,
        AuditPass::OrphanVariables,
        AuditPass::EmptyGroups,
        AuditPass::OrphanMembers,
        AuditPass::OrphanDocuments,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AuditPass::EmptyObjects => "empty_objects",
            AuditPass::OrphanVariables => "orphan_variables",
            AuditPass::EmptyGroups => "empty_groups",
            AuditPass::OrphanMembers => "orphan_members",
            AuditPass::OrphanDocuments => "orphan_documents",
        }
    }
}

impl fmt::Display for AuditPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which part of the catalog an audit may touch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuditScope {
    #[default]
    Local,
    /// Only the listed objects and their descendants.
    Remote { objects: Vec<String> },
}

impl AuditScope {
    fn covers(&self, tag: &TagDefinition, groups_in_scope: &HashSet<String>) -> bool {
        let AuditScope::Remote { objects } = self else {
            return true;
        };
        let owned_by = |name: &Option<String>| {
            name.as_deref()
                .map_or(false, |n| objects.iter().any(|o| o == n))
        };
        objects.iter().any(|o| *o == tag.key)
            || owned_by(&tag.owner_name)
            || tag
                .owner_group
                .as_deref()
                .map_or(false, |g| groups_in_scope.contains(g))
    }
}

/// Corrections per pass of one audit run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub passes: Vec<(AuditPass, u64)>,
}

impl AuditReport {
    pub fn corrections(&self, pass: AuditPass) -> u64 {
        self.passes
            .iter()
            .filter(|(p, _)| *p == pass)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.passes.iter().map(|(_, n)| n).sum()
    }

    /// No pass had anything to repair.
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityAuditor {
    tags: Collection<TagDefinition>,
    documents: Collection<ValueDocument>,
    events: Arc<dyn StoreEventListener>,
}

impl IntegrityAuditor {
    pub fn new(store: Arc<dyn RecordStore>, events: Arc<dyn StoreEventListener>) -> Self {
        IntegrityAuditor {
            tags: Collection::new(Arc::clone(&store), TAGS),
            documents: Collection::new(store, VALUES),
            events,
        }
    }

    /// Runs every pass in order. A storage error aborts the run.
    pub async fn audit(&self, scope: &AuditScope) -> Result<AuditReport, StoreError> {
        let mut report = AuditReport::default();
        for pass in AuditPass::ORDER {
            let n = self.run_pass(pass, scope).await?;
            report.passes.push((pass, n));
        }
        store_metrics::record_audit_corrections(report.total());
        self.events.on_event(StoreEvent::AuditCompleted {
            corrections: report.total(),
        });
        Ok(report)
    }

    /// Runs a single pass and returns the number of records it removed.
    pub async fn run_pass(&self, pass: AuditPass, scope: &AuditScope) -> Result<u64, StoreError> {
        if pass == AuditPass::OrphanDocuments {
            return match scope {
                AuditScope::Local => self.remove_orphan_documents().await,
                AuditScope::Remote { .. } => Ok(0),
            };
        }

        let tags = self.tags.find(&Query::all().oldest_first()).await?;
        let groups_in_scope: HashSet<String> = match scope {
            AuditScope::Local => HashSet::new(),
            AuditScope::Remote { objects } => tags
                .iter()
                .filter(|t| t.kind == TagKind::GroupOwner)
                .filter(|t| {
                    t.owner_name
                        .as_deref()
                        .map_or(false, |o| objects.iter().any(|x| x == o))
                })
                .map(|t| t.key.clone())
                .collect(),
        };
        let keys_of = |kind: TagKind| -> HashSet<&str> {
            tags.iter()
                .filter(|t| t.kind == kind)
                .map(|t| t.key.as_str())
                .collect()
        };

        let doomed: Vec<&TagDefinition> = match pass {
            AuditPass::EmptyObjects => {
                let parents: HashSet<&str> = tags
                    .iter()
                    .filter(|t| t.kind.is_variable_like())
                    .filter_map(|t| t.owner_name.as_deref())
                    .collect();
                tags.iter()
                    .filter(|t| t.kind == TagKind::Object && !parents.contains(t.key.as_str()))
                    .collect()
            }
            AuditPass::OrphanVariables => {
                let objects = keys_of(TagKind::Object);
                tags.iter()
                    .filter(|t| t.kind != TagKind::Object)
                    .filter(|t| {
                        !t.owner_name
                            .as_deref()
                            .map_or(false, |o| objects.contains(o))
                    })
                    .collect()
            }
            AuditPass::EmptyGroups => {
                let populated: HashSet<&str> = tags
                    .iter()
                    .filter(|t| t.kind == TagKind::GroupMember)
                    .filter_map(|t| t.owner_group.as_deref())
                    .collect();
                tags.iter()
                    .filter(|t| t.kind == TagKind::GroupOwner && !populated.contains(t.key.as_str()))
                    .collect()
            }
            AuditPass::OrphanMembers => {
                let groups = keys_of(TagKind::GroupOwner);
                tags.iter()
                    .filter(|t| t.kind == TagKind::GroupMember)
                    .filter(|t| {
                        !t.owner_group
                            .as_deref()
                            .map_or(false, |g| groups.contains(g))
                    })
                    .collect()
            }
            AuditPass::OrphanDocuments => Vec::new(),
        };

        let mut removed = 0;
        for tag in doomed.into_iter().filter(|t| scope.covers(t, &groups_in_scope)) {
            let Some(id) = tag.id.as_deref() else { continue };
            self.tags.remove_id(id).await?;
            removed += 1;
            tracing::warn!(pass = %pass, key = %tag.key, "removing tag");
            self.events.on_event(StoreEvent::AuditCorrection {
                pass: pass.name(),
                collection: TAGS,
                key: tag.key.clone(),
            });
        }
        Ok(removed)
    }

    async fn remove_orphan_documents(&self) -> Result<u64, StoreError> {
        let owners: HashSet<String> = self
            .tags
            .find(&Query::all())
            .await?
            .into_iter()
            .filter(|t| t.kind.holds_values())
            .map(|t| t.key)
            .collect();
        let docs = self.documents.find(&Query::all().oldest_first()).await?;

        let mut removed = 0;
        for doc in docs.iter().filter(|d| !owners.contains(&d.tag_name)) {
            let Some(id) = doc.id.as_deref() else { continue };
            self.documents.remove_id(id).await?;
            removed += 1;
            tracing::warn!(pass = %AuditPass::OrphanDocuments, tag = %doc.tag_name, "removing value document");
            self.events.on_event(StoreEvent::AuditCorrection {
                pass: AuditPass::OrphanDocuments.name(),
                collection: VALUES,
                key: doc.tag_name.clone(),
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::telemetry::noop_event_listener;
    use crate::types::Entry;
    use serde_json::json;

    async fn seeded(tags: &[TagDefinition]) -> (Collection<TagDefinition>, Collection<ValueDocument>, IntegrityAuditor) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let catalog = Collection::new(Arc::clone(&store), TAGS);
        for t in tags {
            catalog.create(t).await.unwrap();
        }
        let docs = Collection::new(Arc::clone(&store), VALUES);
        (catalog, docs, IntegrityAuditor::new(store, noop_event_listener()))
    }

    async fn keys(catalog: &Collection<TagDefinition>) -> Vec<String> {
        let mut k: Vec<String> = catalog
            .find(&Query::all())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.key)
            .collect();
        k.sort();
        k
    }

    fn doc_for(tag: &str) -> ValueDocument {
        ValueDocument::first(
            &TagDefinition::variable(tag, "x"),
            Entry { key: "2022-01-05".into(), value: json!(1), envelope: None },
        )
    }

    #[tokio::test]
    async fn test_clean_catalog_reports_clean() {
        let (_c, _d, auditor) = seeded(&[
            TagDefinition::object("Boiler"),
            TagDefinition::variable("Boiler.Temp", "Boiler"),
            TagDefinition::method("Boiler.Reset", "Boiler"),
        ])
        .await;
        let report = auditor.audit(&AuditScope::Local).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.passes.len(), 5);
    }

    #[tokio::test]
    async fn test_cascade_within_one_run() {
        let (catalog, docs, auditor) = seeded(&[
            TagDefinition::object("Pump"),
            // Owner object "Gone" is missing: pass 2 removes the group owner...
            TagDefinition::group_owner("Gone.Status", "Gone"),
            // ...so pass 4 removes its member in the same run.
            TagDefinition::group_member("Pump.Speed", "Pump", "Gone.Status"),
        ])
        .await;
        docs.create(&doc_for("Pump.Speed")).await.unwrap();

        let report = auditor.audit(&AuditScope::Local).await.unwrap();
        assert_eq!(report.corrections(AuditPass::EmptyObjects), 0);
        assert_eq!(report.corrections(AuditPass::OrphanVariables), 1);
        assert_eq!(report.corrections(AuditPass::OrphanMembers), 1);
        assert_eq!(report.corrections(AuditPass::OrphanDocuments), 1);
        assert_eq!(keys(&catalog).await, vec!["Pump"]);

        // Pump lost its only child after pass 1 ran; the next run picks it up.
        let report = auditor.audit(&AuditScope::Local).await.unwrap();
        assert_eq!(report.corrections(AuditPass::EmptyObjects), 1);
        assert!(auditor.audit(&AuditScope::Local).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_methods_do_not_keep_objects_alive() {
        let (catalog, _d, auditor) = seeded(&[
            TagDefinition::object("Valve"),
            TagDefinition::method("Valve.Open", "Valve"),
        ])
        .await;
        let report = auditor.audit(&AuditScope::Local).await.unwrap();
        assert_eq!(report.corrections(AuditPass::EmptyObjects), 1);
        assert_eq!(report.corrections(AuditPass::OrphanVariables), 1);
        assert!(keys(&catalog).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_group_removed() {
        let (catalog, _d, auditor) = seeded(&[
            TagDefinition::object("Pump"),
            TagDefinition::variable("Pump.Flow", "Pump"),
            TagDefinition::group_owner("Pump.Status", "Pump"),
        ])
        .await;
        let removed = auditor
            .run_pass(AuditPass::EmptyGroups, &AuditScope::Local)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(keys(&catalog).await, vec!["Pump", "Pump.Flow"]);
    }

    #[tokio::test]
    async fn test_remote_scope_limits_candidates() {
        let (catalog, docs, auditor) = seeded(&[
            TagDefinition::object("A"),
            TagDefinition::object("B"),
            TagDefinition::variable("X.Temp", "X"),
        ])
        .await;
        docs.create(&doc_for("Nowhere")).await.unwrap();

        let scope = AuditScope::Remote { objects: vec!["A".to_string()] };
        let report = auditor.audit(&scope).await.unwrap();
        assert_eq!(report.total(), 1);
        assert_eq!(keys(&catalog).await, vec!["B", "X.Temp"]);
        // Document pass is local only.
        assert_eq!(docs.count(&Default::default()).await.unwrap(), 1);

        let report = auditor.audit(&AuditScope::Local).await.unwrap();
        assert_eq!(report.corrections(AuditPass::EmptyObjects), 1);
        assert_eq!(report.corrections(AuditPass::OrphanVariables), 1);
        assert_eq!(report.corrections(AuditPass::OrphanDocuments), 1);
    }
}
