#![doc = include_str!("../README.md")]
// Declare modules
pub mod audit;
pub mod backend;
pub mod core;
pub mod error;
pub mod ingest;
pub mod persistence;
pub mod queue;
pub mod retention;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod values;
pub mod window;

/// Integrity passes, their scope and per-run report.
pub use crate::audit::{AuditPass, AuditReport, AuditScope, IntegrityAuditor};
/// Record-store contract and query vocabulary.
pub use crate::backend::{Collection, Filter, Query, RecordStore, RemoveTarget};
/// Configuration options and main entry point.
pub use crate::core::{StoreConfig, TagVault};
/// Error type for every store operation.
pub use crate::error::StoreError;
pub use crate::ingest::SampleIngestor;
/// Snapshot manager for point-in-time backups and fast recovery.
pub use crate::persistence::Snapshotter;
pub use crate::queue::{BusyGate, QueueManager, QueueSlot, Token, UpdateSerializationQueue};
pub use crate::retention::{DiagnosticLog, RetentionEnforcer};
/// In-process record store.
pub use crate::storage::MemoryStore;
pub use crate::sync::{compare, Comparison, SyncMode, SyncReport, TagDefinitionSynchronizer};
/// Structured event hook for observability.
pub use crate::telemetry::{StoreEvent, StoreEventListener, TracingEventListener};
pub use crate::types::{
    FlatSample, GroupSample, Notification, RetentionPolicy, Sample, TagDefinition, TagKind,
    ValueDocument,
};
pub use crate::values::WindowedValueStore;
pub use crate::window::{BucketSize, TimeUnit};

/// Documents kept per tag when neither the tag nor the configuration says otherwise.
pub const DEFAULT_MAX_DOCUMENTS: u64 = 1_000;
