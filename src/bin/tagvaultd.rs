//! Daemon for the tagvault store.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`TAGVAULT_*`), and CLI flags. Restores the latest snapshot, synchronizes the catalog from the
//! tags file and audits it, then ingests NDJSON notifications from stdin. Sync and audit repeat on
//! a schedule. Runs until graceful shutdown (SIGINT/SIGTERM), or stdin EOF with `--exit-on-eof`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use tagvault::telemetry::tracing_event_listener;
use tagvault::{
    AuditScope, BucketSize, Notification, StoreConfig, SyncMode, TagDefinition, TagKind, TagVault,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

// ---------- CLI ----------

/// tagvault tag store daemon.
#[derive(Parser, Debug)]
#[command(name = "tagvaultd", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, no file is loaded unless default path exists.
    #[arg(long, env = "TAGVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (snapshot storage).
    #[arg(long, env = "TAGVAULT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Authoritative tag definitions (JSON array).
    #[arg(long, env = "TAGVAULT_TAGS_FILE")]
    pub tags_file: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Stop once stdin is exhausted instead of waiting for a signal.
    #[arg(long, default_value_t = false)]
    pub exit_on_eof: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub data_dir: Option<String>,
    pub tags_file: Option<String>,
    pub enable_snapshots: Option<bool>,
    pub snapshot_interval_secs: Option<u64>,
    pub keep_snapshots: Option<usize>,
    pub default_max_documents: Option<u64>,
    /// `[n, "unit"]`, e.g. `[1, "days"]`.
    pub default_bucket_size: Option<BucketSize>,
    pub queue_wait_timeout_ms: Option<u64>,
    pub diagnostics_per_source: Option<u64>,
    pub sync_mode: Option<SyncMode>,
    pub maintenance_interval_secs: Option<u64>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub tags_file: Option<PathBuf>,
    pub sync_mode: SyncMode,
    /// Interval between scheduled sync + audit runs.
    pub maintenance_interval: Duration,
    pub exit_on_eof: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            tags_file: None,
            sync_mode: SyncMode::Local,
            maintenance_interval: Duration::from_secs(60 * 60),
            exit_on_eof: false,
        }
    }
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(StoreConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("tagvaultd.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        // TAGVAULT_DEFAULT_MAX_DOCUMENTS: single `_` after the prefix, `__` between nested keys.
        Environment::with_prefix("TAGVAULT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut store_config = StoreConfig {
        event_listener: tracing_event_listener(),
        ..StoreConfig::default()
    };
    let mut options = DaemonOptions::default();
    merge_into_store_config(&mut store_config, &mut options, &partial);

    if let Some(ref d) = cli.data_dir {
        store_config.data_dir = d.clone();
    }
    if let Some(ref t) = cli.tags_file {
        options.tags_file = Some(t.clone());
    }
    options.exit_on_eof = cli.exit_on_eof;

    store_config.validate().map_err(|e| e.to_string())?;
    if options.maintenance_interval.is_zero() {
        return Err("maintenance_interval_secs must be > 0".to_string());
    }
    Ok((store_config, options))
}

/// Merge file/env partial config. Only overwrites fields that are `Some`.
fn merge_into_store_config(
    base: &mut StoreConfig,
    options: &mut DaemonOptions,
    partial: &DaemonFileConfig,
) {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(b) = partial.enable_snapshots {
        base.enable_snapshots = b;
    }
    if let Some(secs) = partial.snapshot_interval_secs {
        base.snapshot_interval = Duration::from_secs(secs);
    }
    if let Some(n) = partial.keep_snapshots {
        base.keep_snapshots = n;
    }
    if let Some(n) = partial.default_max_documents {
        base.default_max_documents = n;
    }
    if let Some(b) = partial.default_bucket_size {
        base.default_bucket_size = b;
    }
    if let Some(ms) = partial.queue_wait_timeout_ms {
        base.queue_wait_timeout = Some(Duration::from_millis(ms));
    }
    if let Some(n) = partial.diagnostics_per_source {
        base.diagnostics_per_source = n;
    }

    if let Some(s) = &partial.tags_file {
        options.tags_file = Some(PathBuf::from(s));
    }
    if let Some(mode) = partial.sync_mode {
        options.sync_mode = mode;
    }
    if let Some(secs) = partial.maintenance_interval_secs {
        options.maintenance_interval = Duration::from_secs(secs);
    }
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let probe = data_dir.join(".tagvault_write_probe");
    std::fs::write(&probe, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(probe);
    Ok(())
}

fn load_definitions(path: &Path) -> Result<Vec<TagDefinition>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("tags file {} cannot be read: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("tags file {} is not a tag definition list: {}", path.display(), e))
}

// ---------- Maintenance ----------

/// One sync + audit cycle. Failures are logged and retried on the next cycle.
async fn run_maintenance(vault: &TagVault, definitions: &[TagDefinition], mode: SyncMode) {
    if !definitions.is_empty() {
        match vault.sync_definitions(definitions, mode).await {
            Ok(report) => tracing::info!(
                added = report.added,
                updated = report.updated,
                deleted = report.deleted,
                total = report.total,
                "catalog synchronized"
            ),
            Err(e) => {
                tracing::error!(error = %e, "catalog sync failed");
                return;
            }
        }
    }

    let scope = match mode {
        SyncMode::Local => AuditScope::Local,
        SyncMode::Remote => AuditScope::Remote {
            objects: definitions
                .iter()
                .filter(|d| d.kind == TagKind::Object)
                .map(|d| d.key.clone())
                .collect(),
        },
    };
    match vault.audit_report(&scope).await {
        Ok(report) if report.is_clean() => tracing::info!("catalog consistent"),
        Ok(report) => tracing::warn!(corrections = report.total(), "catalog repaired"),
        Err(e) => tracing::error!(error = %e, "integrity audit failed"),
    }
}

/// Decodes one NDJSON line and queues it. Bad lines are logged and skipped.
async fn submit_line(vault: &TagVault, line: &str) -> Option<JoinHandle<Result<(), tagvault::StoreError>>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let decoded = serde_json::from_str::<serde_json::Value>(line)
        .map_err(tagvault::StoreError::from)
        .and_then(|raw| Notification::from_json(&raw));
    let notification = match decoded {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed notification");
            return None;
        }
    };
    match vault.submit(notification).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(error = %e, "failed to queue notification");
            None
        }
    }
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            },
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Runs the daemon until a shutdown signal (or stdin EOF with `exit_on_eof`), then drains
/// queued notifications and writes a final snapshot.
async fn run(
    vault: TagVault,
    definitions: Vec<TagDefinition>,
    options: DaemonOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_maintenance(&vault, &definitions, options.sync_mode).await;
    tracing::info!(
        data_dir = %vault.config().data_dir.display(),
        tags = definitions.len(),
        "tagvaultd running; reading notifications from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut in_flight: Vec<JoinHandle<Result<(), tagvault::StoreError>>> = Vec::new();
    let interval = options.maintenance_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(handle) = submit_line(&vault, &line).await {
                        in_flight.retain(|h| !h.is_finished());
                        in_flight.push(handle);
                    }
                }
                Ok(None) => {
                    stdin_open = false;
                    tracing::info!("stdin closed");
                    if options.exit_on_eof {
                        break;
                    }
                }
                Err(e) => {
                    stdin_open = false;
                    tracing::error!(error = %e, "stdin read failed");
                    if options.exit_on_eof {
                        break;
                    }
                }
            },
            _ = ticker.tick() => {
                run_maintenance(&vault, &definitions, options.sync_mode).await;
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!(pending = in_flight.len(), "draining queued notifications");
    for handle in in_flight {
        // Rejections were already reported through the event listener.
        let _ = handle.await;
    }
    vault.shutdown().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (store_config, options) = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("data_dir={}", store_config.data_dir.display());
        println!("enable_snapshots={}", store_config.enable_snapshots);
        println!("snapshot_interval_secs={}", store_config.snapshot_interval.as_secs());
        println!("default_max_documents={}", store_config.default_max_documents);
        println!("default_bucket_size={}", store_config.default_bucket_size);
        println!(
            "tags_file={}",
            options
                .tags_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        println!("sync_mode={:?}", options.sync_mode);
        println!("maintenance_interval_secs={}", options.maintenance_interval.as_secs());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Safe startup: data_dir must exist and be writable before opening the store.
    if store_config.enable_snapshots {
        check_data_dir_writable(&store_config.data_dir).map_err(|e| {
            eprintln!("startup check failed: {}", e);
            e
        })?;
    }

    let definitions = match &options.tags_file {
        Some(path) => load_definitions(path).map_err(|e| {
            eprintln!("startup check failed: {}", e);
            e
        })?,
        None => Vec::new(),
    };

    let vault = TagVault::open(store_config).await.map_err(|e| {
        eprintln!("failed to open store: {}", e);
        e
    })?;

    run(vault, definitions, options).await
}
