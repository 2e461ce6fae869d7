use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use atc_catalog::PgCatalogReader;
use atc_core::checker::ExpectedOwnership;
use atc_notify::{FrontEnd, FrontEndConfig, NotifyError, Transport};
use atc_storage::LocalStore;
use atc_worker::providers::StoreProviders;
use atc_worker::{window_gate, within_working_hours, Worker, WorkerConfig};
use chrono::{Local, Timelike};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WINDOW_POLL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "atc-worker", about = "Attachment integrity audit worker")]
struct Args {
    /// DSN of the authoritative issue-tracker catalog (read only).
    #[arg(long, env = "ATC_CATALOG_DSN")]
    catalog_dsn: String,
    /// Path of the local sqlite store.
    #[arg(long, env = "ATC_LOCAL_STORE", default_value = "attacheck.db")]
    local_store: PathBuf,
    /// Base directory holding the attachment tree on the shared filesystem.
    #[arg(long, env = "ATC_BASE_PATH")]
    base_path: PathBuf,
    /// Seconds after which the mirror is refreshed from the catalog.
    #[arg(long, env = "ATC_REFRESH_PERIOD", default_value_t = 600)]
    refresh_period: i64,
    #[arg(long, env = "ATC_CATALOG_BATCH_SIZE", default_value_t = 1000)]
    catalog_batch_size: i64,
    #[arg(long, env = "ATC_FS_BATCH_SIZE", default_value_t = 100)]
    fs_batch_size: i64,
    /// Expected owner uid of every attachment file.
    #[arg(long, env = "ATC_UID")]
    uid: u32,
    /// Expected group gid of every attachment file.
    #[arg(long, env = "ATC_GID")]
    gid: u32,
    /// Expected permission bits, last three octal digits.
    #[arg(long, env = "ATC_FILE_MODE", default_value = "644")]
    file_mode: String,
    /// Hour of day the working window opens.
    #[arg(long, env = "ATC_START_AT", default_value_t = 0)]
    start_at: u32,
    /// Hour of day the working window closes.
    #[arg(long, env = "ATC_STOP_AT", default_value_t = 0)]
    stop_at: u32,
    #[arg(long, env = "ATC_TIME_FORMAT", default_value = "%Y-%m-%d %H:%M:%S")]
    time_format: String,
    /// Maximum payload size of one outbound document, in bytes.
    #[arg(long, env = "ATC_TRANSPORT_LIMIT", default_value_t = 50 * 1024 * 1024)]
    transport_limit: usize,
    #[arg(long, env = "ATC_SAFETY_MARGIN", default_value_t = 15_000)]
    safety_margin: usize,
    #[arg(long, env = "ATC_DELIMITER", default_value_t = ';')]
    delimiter: char,
    /// Notification destinations, comma separated.
    #[arg(long, env = "ATC_CHAT_IDS", value_delimiter = ',')]
    chat_ids: Vec<i64>,
    /// Terminate after the backlog is exhausted instead of re-polling.
    #[arg(long, env = "ATC_RUN_ONCE", default_value_t = false)]
    run_once: bool,
    /// Seconds between backlog re-polls when nothing is left to verify.
    #[arg(long, env = "ATC_IDLE_WAIT", default_value_t = 60)]
    idle_wait: u64,
}

/// Outbound delivery for deployments without a wired chat transport: every
/// message and document lands in the log.
struct TracingTransport;

#[async_trait]
impl Transport for TracingTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        info!(chat_id, text, "outbound message");
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError> {
        info!(chat_id, filename, size = bytes.len(), caption, "outbound document");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = LocalStore::open(&args.local_store, args.time_format.clone())
        .with_context(|| format!("opening local store at {}", args.local_store.display()))?;
    let store = Arc::new(Mutex::new(store));

    let catalog = PgCatalogReader::connect(&args.catalog_dsn)
        .await
        .context("connecting to the catalog")?;

    let initially_paused = !within_working_hours(Local::now().hour(), args.start_at, args.stop_at);
    let (paused_tx, paused_rx) = watch::channel(initially_paused);
    let cancel = CancellationToken::new();

    let gate = tokio::spawn(window_gate(
        paused_tx,
        args.start_at,
        args.stop_at,
        WINDOW_POLL,
        cancel.clone(),
    ));

    let front_end = FrontEnd::new(
        TracingTransport,
        StoreProviders::new(Arc::clone(&store), std::env::temp_dir()),
        FrontEndConfig {
            transport_limit: args.transport_limit,
            safety_margin: args.safety_margin,
            delimiter: args.delimiter,
            chats: args.chat_ids.clone(),
        },
    );

    let worker = Worker::new(
        Arc::clone(&store),
        catalog,
        WorkerConfig {
            base_path: args.base_path,
            refresh_period_secs: args.refresh_period,
            catalog_batch_size: args.catalog_batch_size,
            fs_batch_size: args.fs_batch_size,
            expected: ExpectedOwnership {
                uid: args.uid,
                gid: args.gid,
                mode: args.file_mode,
            },
            run_once: args.run_once,
            idle_wait: Duration::from_secs(args.idle_wait),
            pause_poll: WINDOW_POLL,
        },
        paused_rx,
        cancel.clone(),
    );

    if let Err(err) = front_end.broadcast("attachment audit worker started").await {
        warn!(error = %err, "broadcast failed");
    }

    let worker_task = tokio::spawn(worker.run());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let run_result = worker_task.await.context("worker task panicked")?;
    let _ = gate.await;

    match &run_result {
        Ok(()) => {
            if let Err(err) = front_end.broadcast("attachment audit worker finished").await {
                warn!(error = %err, "broadcast failed");
            }
        }
        Err(err) => {
            let text = format!("attachment audit worker failed: {err}");
            if let Err(send_err) = front_end.broadcast(&text).await {
                warn!(error = %send_err, "broadcast failed");
            }
        }
    }

    run_result.map_err(Into::into)
}
