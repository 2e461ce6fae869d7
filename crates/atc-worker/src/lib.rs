pub mod providers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atc_catalog::{CatalogError, CatalogReader};
use atc_core::checker::{check_file_status, ExpectedOwnership};
use atc_storage::{LocalStore, ReportEntry, StorageError, NEVER_LAUNCHED};
use chrono::{Local, Timelike, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The local store shared between the worker and the front-end providers.
pub type SharedStore = Arc<Mutex<LocalStore>>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base directory the catalog-relative attachment paths are joined onto.
    pub base_path: PathBuf,
    /// Mirror refresh is due when the last pass is older than this.
    pub refresh_period_secs: i64,
    /// Page size of one catalog fetch during a mirror pass.
    pub catalog_batch_size: i64,
    /// Batch size of one verification round against the filesystem.
    pub fs_batch_size: i64,
    pub expected: ExpectedOwnership,
    /// Terminate once the backlog is exhausted instead of re-polling.
    pub run_once: bool,
    /// Re-poll delay after the backlog ran dry (ignored with `run_once`).
    pub idle_wait: Duration,
    /// Delay between checks of the paused flag while outside the window.
    pub pause_poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No unprocessed rows are left.
    Exhausted,
    /// The loop yielded to a pause or cancellation before running dry.
    Interrupted,
}

/// Reconciliation worker: keeps the local mirror fresh and walks the
/// unprocessed backlog in batches, recording one verification report per
/// attachment.
pub struct Worker<C: CatalogReader> {
    store: SharedStore,
    catalog: C,
    config: WorkerConfig,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl<C: CatalogReader> Worker<C> {
    pub fn new(
        store: SharedStore,
        catalog: C,
        config: WorkerConfig,
        paused: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            paused,
            cancel,
        }
    }

    /// Run until the backlog policy says done or the token is cancelled.
    ///
    /// Every exit path, error included, cancels the sibling activities and
    /// releases the store and catalog connections exactly once.
    pub async fn run(self) -> Result<(), WorkerError> {
        let result = self.run_inner().await;
        if let Err(err) = &result {
            error!(error = %err, "verification activity failed");
        }
        self.cancel.cancel();
        self.store.lock().await.close();
        self.catalog.close().await;
        result
    }

    async fn run_inner(&self) -> Result<(), WorkerError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("worker cancelled");
                return Ok(());
            }
            if *self.paused.borrow() {
                debug!("outside the working window, waiting");
                self.sleep(self.config.pause_poll).await;
                continue;
            }

            self.refresh_if_due().await?;

            match self.drain_backlog().await? {
                DrainOutcome::Interrupted => continue,
                DrainOutcome::Exhausted => {
                    if self.config.run_once {
                        info!("backlog exhausted, run-once worker is done");
                        return Ok(());
                    }
                    debug!("backlog exhausted, idling before the next poll");
                    self.sleep(self.config.idle_wait).await;
                }
            }
        }
    }

    /// Run a full mirror pass when none was ever recorded or the last one is
    /// older than the refresh period. Returns whether a pass ran.
    pub async fn refresh_if_due(&self) -> Result<bool, WorkerError> {
        let elapsed = {
            let store = self.store.lock().await;
            store.seconds_since_last_launch(Utc::now())?
        };
        if elapsed != NEVER_LAUNCHED && elapsed <= self.config.refresh_period_secs {
            return Ok(false);
        }
        self.mirror_pass().await?;
        Ok(true)
    }

    /// Page the whole catalog into the local store, then record the launch
    /// time once the pass completed.
    pub async fn mirror_pass(&self) -> Result<usize, WorkerError> {
        info!("starting mirror pass");
        let mut offset = 0i64;
        let mut mirrored = 0usize;
        loop {
            let page = self
                .catalog
                .fetch_attachments(offset, self.config.catalog_batch_size)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;
            let inserted = {
                let mut store = self.store.lock().await;
                store.save_attachments(&page)?
            };
            mirrored += inserted;
            debug!(page = page.len(), inserted, "mirrored catalog page");
        }
        {
            let store = self.store.lock().await;
            store.save_launch_time(Utc::now())?;
        }
        info!(mirrored, "mirror pass complete");
        Ok(mirrored)
    }

    /// Verify unprocessed attachments batch by batch until none remain.
    ///
    /// Each request restarts at offset 0: processed rows drop out of the
    /// unprocessed set, so an advancing offset over the shrinking result
    /// would skip rows.
    pub async fn drain_backlog(&self) -> Result<DrainOutcome, WorkerError> {
        loop {
            if self.cancel.is_cancelled() || *self.paused.borrow() {
                return Ok(DrainOutcome::Interrupted);
            }

            let batch = {
                let store = self.store.lock().await;
                store.unprocessed_attachments(self.config.fs_batch_size, 0)?
            };
            if batch.is_empty() {
                return Ok(DrainOutcome::Exhausted);
            }
            self.process_batch(batch).await?;
        }
    }

    async fn process_batch(
        &self,
        batch: Vec<atc_core::model::Attachment>,
    ) -> Result<(), WorkerError> {
        let mut ids = Vec::with_capacity(batch.len());
        let mut entries = Vec::with_capacity(batch.len());
        for attachment in batch {
            let full_path = self.config.base_path.join(&attachment.relative_path);
            let (status, message) =
                check_file_status(&attachment, &full_path, &self.config.expected).await;
            ids.push(attachment.id);
            entries.push(ReportEntry {
                attachment,
                full_path: full_path.to_string_lossy().into_owned(),
                status,
                message,
            });
        }

        // the whole batch is marked and reported as one unit
        let mut store = self.store.lock().await;
        store.mark_processed(&ids)?;
        store.save_attachment_reports(&entries)?;
        debug!(batch = ids.len(), "verified batch");
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// True when `hour` falls inside the allowed `[start_at, stop_at)` window.
/// A wrap-around window (start after stop) spans midnight; equal bounds mean
/// no gate is configured and the worker is always active.
pub fn within_working_hours(hour: u32, start_at: u32, stop_at: u32) -> bool {
    use std::cmp::Ordering;
    match start_at.cmp(&stop_at) {
        Ordering::Equal => true,
        Ordering::Less => (start_at..stop_at).contains(&hour),
        Ordering::Greater => hour >= start_at || hour < stop_at,
    }
}

/// Window gate activity: recompute the paused flag from the local
/// time-of-day on a fixed interval and publish it over the watch channel.
/// Single writer; the verification loop polls the receiver.
pub async fn window_gate(
    paused_tx: watch::Sender<bool>,
    start_at: u32,
    stop_at: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let hour = Local::now().hour();
        let paused = !within_working_hours(hour, start_at, stop_at);
        if paused_tx.send(paused).is_err() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
