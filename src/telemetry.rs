use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, metrics, or custom sinks. [`TracingEventListener`] covers the common case.
pub trait StoreEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StoreEvent);
}

/// Structured events emitted by the core. Every corrective or failed action has one.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    TagCreated { key: String },
    TagPatched { key: String },
    TagRecreated { key: String },
    TagRemoved { key: String, reason: &'static str },
    SyncCompleted { added: u64, updated: u64, deleted: u64, total: u64 },

    AuditCorrection { pass: &'static str, collection: &'static str, key: String },
    AuditCompleted { corrections: u64 },

    RetentionPruned { collection: String, owner: String, removed: u64 },

    SampleRejected { source: String, error: String },
    NotificationDropped { resource: String },
    QueueHandlerFailed { queue: String, token: u64, error: String },

    SnapshotCreated { path: PathBuf, timestamp: u64 },
    SnapshotFailed { error: String },
    SnapshotRestored { records: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl StoreEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn StoreEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to `tracing` under the `tagvault` target.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl StoreEventListener for TracingEventListener {
    fn on_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::TagCreated { key } => tracing::info!(target: "tagvault", %key, "tag created"),
            StoreEvent::TagPatched { key } => tracing::info!(target: "tagvault", %key, "tag updated"),
            StoreEvent::TagRecreated { key } => {
                tracing::info!(target: "tagvault", %key, "tag structure changed, recreated")
            }
            StoreEvent::TagRemoved { key, reason } => {
                tracing::info!(target: "tagvault", %key, reason, "tag removed")
            }
            StoreEvent::SyncCompleted { added, updated, deleted, total } => tracing::info!(
                target: "tagvault",
                added, updated, deleted, total,
                "tag definitions synchronized"
            ),
            StoreEvent::AuditCorrection { pass, collection, key } => tracing::warn!(
                target: "tagvault",
                pass, collection, %key,
                "integrity violation repaired"
            ),
            StoreEvent::AuditCompleted { corrections } => {
                if corrections == 0 {
                    tracing::info!(target: "tagvault", "integrity audit clean");
                } else {
                    tracing::warn!(target: "tagvault", corrections, "integrity audit repaired violations");
                }
            }
            StoreEvent::RetentionPruned { collection, owner, removed } => tracing::debug!(
                target: "tagvault",
                %collection, %owner, removed,
                "retention pruned documents"
            ),
            StoreEvent::SampleRejected { source, error } => {
                tracing::error!(target: "tagvault", %source, %error, "sample rejected")
            }
            StoreEvent::NotificationDropped { resource } => {
                tracing::debug!(target: "tagvault", %resource, "notification dropped, resource busy")
            }
            StoreEvent::QueueHandlerFailed { queue, token, error } => {
                tracing::error!(target: "tagvault", %queue, token, %error, "queued update failed")
            }
            StoreEvent::SnapshotCreated { path, timestamp } => tracing::info!(
                target: "tagvault",
                path = %path.display(), timestamp,
                "snapshot created"
            ),
            StoreEvent::SnapshotFailed { error } => {
                tracing::error!(target: "tagvault", %error, "snapshot failed")
            }
            StoreEvent::SnapshotRestored { records } => {
                tracing::info!(target: "tagvault", records, "snapshot restored")
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn StoreEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is a no-op until a recorder is installed. With the `prometheus` feature,
/// [`store_metrics::InProcessPrometheus`] installs one and renders the exposition text
/// in-process (no HTTP server).
pub mod store_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const SAMPLES_WRITTEN: &str = "tagvault_samples_written";
    pub const DOCUMENTS_PRUNED: &str = "tagvault_documents_pruned";
    pub const TAGS_SYNCED: &str = "tagvault_tags_synced";
    pub const AUDIT_CORRECTIONS: &str = "tagvault_audit_corrections";
    pub const NOTIFICATIONS_DROPPED: &str = "tagvault_notifications_dropped";
    pub const SNAPSHOT_DURATION_SECONDS: &str = "tagvault_snapshot_duration_seconds";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tagvault-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_samples_written(n: u64) {
        if n > 0 {
            ::metrics::counter!(SAMPLES_WRITTEN).increment(n);
        }
    }

    #[inline]
    pub fn record_documents_pruned(n: u64) {
        if n > 0 {
            ::metrics::counter!(DOCUMENTS_PRUNED).increment(n);
        }
    }

    #[inline]
    pub fn record_tags_synced(changes: u64) {
        if changes > 0 {
            ::metrics::counter!(TAGS_SYNCED).increment(changes);
        }
    }

    #[inline]
    pub fn record_audit_corrections(n: u64) {
        if n > 0 {
            ::metrics::counter!(AUDIT_CORRECTIONS).increment(n);
        }
    }

    #[inline]
    pub fn record_notification_dropped() {
        ::metrics::counter!(NOTIFICATIONS_DROPPED).increment(1);
    }

    #[inline]
    pub fn record_snapshot(duration: Duration) {
        ::metrics::histogram!(SNAPSHOT_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    pub fn describe_all() {
        describe_counter!(
            SAMPLES_WRITTEN,
            Unit::Count,
            "Samples merged into value documents."
        );
        describe_counter!(
            DOCUMENTS_PRUNED,
            Unit::Count,
            "Documents deleted by retention enforcement."
        );
        describe_counter!(
            TAGS_SYNCED,
            Unit::Count,
            "Catalog changes (adds, updates, deletes) applied by synchronization."
        );
        describe_counter!(
            AUDIT_CORRECTIONS,
            Unit::Count,
            "Records removed by the integrity auditor."
        );
        describe_counter!(
            NOTIFICATIONS_DROPPED,
            Unit::Count,
            "Command notifications ignored because their resource was busy."
        );
        describe_histogram!(
            SNAPSHOT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to write and install a store snapshot."
        );
    }
}
