//! Core orchestration: owns the record store and wires catalog sync, windowed value storage,
//! retention, integrity audits, serialized ingestion and snapshotting behind one API.

use crate::audit::{AuditReport, AuditScope, IntegrityAuditor};
use crate::backend::RecordStore;
use crate::error::StoreError;
use crate::ingest::SampleIngestor;
use crate::persistence::Snapshotter;
use crate::retention::{DiagnosticLog, DiagnosticRecord, RetentionEnforcer};
use crate::storage::MemoryStore;
use crate::sync::{SyncMode, SyncReport, TagDefinitionSynchronizer};
use crate::telemetry::{noop_event_listener, store_metrics, StoreEvent, StoreEventListener};
use crate::types::{FlatSample, Notification, TagDefinition, ValueDocument};
use crate::values::WindowedValueStore;
use crate::window::BucketSize;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Commands sent to the background maintenance task.
enum MaintenanceCommand {
    Snapshot {
        ack: oneshot::Sender<Result<PathBuf, StoreError>>,
    },
    Shutdown {
        ack: Option<oneshot::Sender<Result<(), StoreError>>>,
    },
}

/// Configuration options for [`TagVault`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory for persistence files (snapshots live under `snapshots/`).
    pub data_dir: PathBuf,
    /// Whether to restore from and periodically write snapshots.
    pub enable_snapshots: bool,
    /// Interval between automatic snapshots (if enabled).
    pub snapshot_interval: Duration,
    /// Snapshot files retained after each write.
    pub keep_snapshots: usize,
    /// Documents kept per tag when the tag has no `maxDocuments`. 0 = unbounded.
    pub default_max_documents: u64,
    /// Bucket size for tags without a `bucketSize`.
    pub default_bucket_size: BucketSize,
    /// How long a queued sample may wait for its turn. `None` waits indefinitely.
    pub queue_wait_timeout: Option<Duration>,
    /// Diagnostic records kept per source.
    pub diagnostics_per_source: u64,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn StoreEventListener>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from("./data"),
            enable_snapshots: true,
            snapshot_interval: Duration::from_secs(60 * 15), // 15 minutes
            keep_snapshots: 3,
            default_max_documents: crate::DEFAULT_MAX_DOCUMENTS,
            default_bucket_size: BucketSize::default(),
            queue_wait_timeout: None,
            diagnostics_per_source: 1_000,
            event_listener: noop_event_listener(),
        }
    }
}

impl StoreConfig {
    /// In-memory configuration: no snapshots, nothing touches the disk.
    pub fn ephemeral() -> Self {
        StoreConfig {
            enable_snapshots: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        self.default_bucket_size
            .validate()
            .map_err(|e| StoreError::ConfigError(format!("default_bucket_size: {}", e)))?;
        if self.enable_snapshots && self.snapshot_interval.is_zero() {
            return Err(StoreError::ConfigError(
                "snapshot_interval must be > 0 when snapshots are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// The tag store.
#[derive(Debug)]
pub struct TagVault {
    store: Arc<MemoryStore>,
    values: Arc<WindowedValueStore>,
    synchronizer: TagDefinitionSynchronizer,
    auditor: IntegrityAuditor,
    ingestor: SampleIngestor,
    diagnostics: DiagnosticLog,
    snapshotter: Option<Arc<Snapshotter>>,
    maintenance: Option<(mpsc::Sender<MaintenanceCommand>, JoinHandle<()>)>,
    config: StoreConfig,
}

impl std::fmt::Debug for MaintenanceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceCommand::Snapshot { .. } => f.write_str("Snapshot"),
            MaintenanceCommand::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl TagVault {
    /// Opens a store with the provided configuration.
    ///
    /// If snapshots are enabled, the latest snapshot under `data_dir/snapshots` is restored and
    /// a background task is spawned that writes a new one every `snapshot_interval`. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the latest snapshot cannot be read.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let events = Arc::clone(&config.event_listener);

        let snapshotter = if config.enable_snapshots {
            Some(Arc::new(Snapshotter::new(config.data_dir.join("snapshots"))?))
        } else {
            None
        };

        let store = match snapshotter.as_ref().map(|s| s.load_latest_snapshot()).transpose()?.flatten() {
            Some(image) => {
                let store = MemoryStore::from_image(image);
                events.on_event(StoreEvent::SnapshotRestored {
                    records: store.len()?,
                });
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };

        let backend: Arc<dyn RecordStore> = store.clone();
        let retention = RetentionEnforcer::new(
            Arc::clone(&backend),
            config.default_max_documents,
            Arc::clone(&events),
        );
        let values = Arc::new(WindowedValueStore::new(
            Arc::clone(&backend),
            retention.clone(),
            config.default_bucket_size,
        ));
        let ingestor = SampleIngestor::new(
            Arc::clone(&values),
            config.queue_wait_timeout,
            Arc::clone(&events),
        );

        let maintenance = snapshotter.as_ref().map(|snapshotter| {
            let (tx, rx) = mpsc::channel(16);
            let handle = tokio::spawn(maintenance_loop(
                rx,
                Arc::clone(&store),
                Arc::clone(snapshotter),
                config.snapshot_interval,
                config.keep_snapshots,
                Arc::clone(&events),
            ));
            (tx, handle)
        });

        Ok(TagVault {
            synchronizer: TagDefinitionSynchronizer::new(Arc::clone(&backend), Arc::clone(&events)),
            auditor: IntegrityAuditor::new(backend, Arc::clone(&events)),
            diagnostics: DiagnosticLog::new(retention, config.diagnostics_per_source),
            store,
            values,
            ingestor,
            snapshotter,
            maintenance,
            config,
        })
    }

    /// Opens an empty store that never touches the disk.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(StoreConfig::ephemeral()).await
    }

    /// Reconciles the catalog with `definitions`.
    pub async fn sync_definitions(
        &self,
        definitions: &[TagDefinition],
        mode: SyncMode,
    ) -> Result<SyncReport, StoreError> {
        self.synchronizer.sync(definitions, mode).await
    }

    /// Runs every integrity pass. Returns `true` if nothing needed repair.
    pub async fn audit(&self, scope: &AuditScope) -> Result<bool, StoreError> {
        Ok(self.auditor.audit(scope).await?.is_clean())
    }

    /// Like [`TagVault::audit`] but returns the per-pass breakdown.
    pub async fn audit_report(&self, scope: &AuditScope) -> Result<AuditReport, StoreError> {
        self.auditor.audit(scope).await
    }

    pub fn auditor(&self) -> &IntegrityAuditor {
        &self.auditor
    }

    /// Queues a notification for serialized processing and returns without waiting.
    pub async fn submit(
        &self,
        notification: Notification,
    ) -> Result<JoinHandle<Result<(), StoreError>>, StoreError> {
        self.ingestor.submit(notification).await
    }

    /// Queues a notification and waits until it is stored.
    pub async fn ingest(&self, notification: Notification) -> Result<(), StoreError> {
        self.ingestor.ingest(notification).await
    }

    pub async fn history(&self, tag: &str) -> Result<Vec<FlatSample>, StoreError> {
        self.values.history(tag).await
    }

    pub async fn documents(&self, tag: &str) -> Result<Vec<ValueDocument>, StoreError> {
        self.values.documents(tag).await
    }

    pub async fn log_diagnostic(&self, source: &str, message: &str) -> Result<(), StoreError> {
        self.diagnostics.append(source, message).await
    }

    pub async fn diagnostics(&self, source: &str) -> Result<Vec<DiagnosticRecord>, StoreError> {
        self.diagnostics.entries(source).await
    }

    /// Writes a snapshot now and returns its path.
    ///
    /// # Errors
    /// Returns an error if snapshots are disabled or the background task cannot be reached.
    pub async fn snapshot(&self) -> Result<PathBuf, StoreError> {
        let Some((tx, _)) = &self.maintenance else {
            return Err(StoreError::ConfigError("Snapshots are not enabled".to_string()));
        };
        let (ack, rx) = oneshot::channel();
        tx.send(MaintenanceCommand::Snapshot { ack })
            .await
            .map_err(|e| StoreError::BackgroundTaskError(format!("Failed to send snapshot command: {}", e)))?;
        rx.await
            .map_err(|e| StoreError::BackgroundTaskError(format!("Failed to receive snapshot ack: {}", e)))?
    }

    pub fn values(&self) -> &Arc<WindowedValueStore> {
        &self.values
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn snapshotter(&self) -> Option<&Arc<Snapshotter>> {
        self.snapshotter.as_ref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Stops the maintenance task after a final snapshot.
    pub async fn shutdown(mut self) -> Result<(), StoreError> {
        let Some((tx, handle)) = self.maintenance.take() else {
            return Ok(());
        };
        let (ack, rx) = oneshot::channel();
        tx.send(MaintenanceCommand::Shutdown { ack: Some(ack) })
            .await
            .map_err(|e| StoreError::BackgroundTaskError(format!("Failed to send shutdown command: {}", e)))?;
        let result = rx
            .await
            .map_err(|e| StoreError::BackgroundTaskError(format!("Failed to receive shutdown ack: {}", e)))?;
        handle.await?;
        result
    }
}

/// Best-effort stop if [`TagVault::shutdown`] was not called.
impl Drop for TagVault {
    fn drop(&mut self) {
        if let Some((tx, _handle)) = self.maintenance.take() {
            let _ = tx.try_send(MaintenanceCommand::Shutdown { ack: None });
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

async fn write_snapshot(
    store: &Arc<MemoryStore>,
    snapshotter: &Arc<Snapshotter>,
    keep: usize,
    events: &Arc<dyn StoreEventListener>,
) -> Result<PathBuf, StoreError> {
    let started = Instant::now();
    let image = store.image()?;
    let timestamp = now_nanos();
    let snapshotter = Arc::clone(snapshotter);
    let res = tokio::task::spawn_blocking(move || {
        let path = snapshotter.create_snapshot(&image, timestamp)?;
        snapshotter.prune(keep)?;
        Ok::<_, StoreError>(path)
    })
    .await
    .map_err(StoreError::from)
    .and_then(|r| r);

    match &res {
        Ok(path) => {
            store_metrics::record_snapshot(started.elapsed());
            events.on_event(StoreEvent::SnapshotCreated {
                path: path.clone(),
                timestamp,
            })
        }
        Err(e) => events.on_event(StoreEvent::SnapshotFailed {
            error: e.to_string(),
        }),
    }
    res
}

async fn maintenance_loop(
    mut commands: mpsc::Receiver<MaintenanceCommand>,
    store: Arc<MemoryStore>,
    snapshotter: Arc<Snapshotter>,
    interval: Duration,
    keep: usize,
    events: Arc<dyn StoreEventListener>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = write_snapshot(&store, &snapshotter, keep, &events).await;
            }
            cmd = commands.recv() => match cmd {
                Some(MaintenanceCommand::Snapshot { ack }) => {
                    let res = write_snapshot(&store, &snapshotter, keep, &events).await;
                    let _ = ack.send(res);
                }
                Some(MaintenanceCommand::Shutdown { ack }) => {
                    let res = write_snapshot(&store, &snapshotter, keep, &events).await.map(|_| ());
                    if let Some(ack) = ack {
                        let _ = ack.send(res);
                    }
                    break;
                }
                // TagVault dropped without a shutdown command.
                None => break,
            }
        }
    }
    tracing::debug!("maintenance task stopped");
}
