use std::path::PathBuf;

use async_trait::async_trait;
use atc_core::report::ReportBundle;
use atc_notify::{NotifyError, ReportProviders, SqliteExport};
use chrono::Utc;

use crate::SharedStore;

/// Front-end providers backed by the shared local store: the progress
/// string, the cached report bundle, and the alternate sqlite export.
pub struct StoreProviders {
    store: SharedStore,
    export_dir: PathBuf,
}

impl StoreProviders {
    pub fn new(store: SharedStore, export_dir: PathBuf) -> Self {
        Self { store, export_dir }
    }
}

#[async_trait]
impl ReportProviders for StoreProviders {
    async fn progress(&self) -> Result<String, NotifyError> {
        let counts = {
            let store = self.store.lock().await;
            store
                .progress_counts()
                .map_err(|err| NotifyError::Provider(err.to_string()))?
        };
        if counts.total == 0 {
            return Ok("No attachment records in the local store yet.".to_string());
        }
        let percent = 100.0 * counts.processed as f64 / counts.total as f64;
        Ok(format!(
            "Processed {} of {} attachments ({percent:.2} %)",
            counts.processed, counts.total
        ))
    }

    async fn build_report(&self) -> Result<ReportBundle, NotifyError> {
        let store = self.store.lock().await;
        let rows = store
            .reports_full()
            .map_err(|err| NotifyError::Provider(err.to_string()))?;
        let total = store
            .total_attachments()
            .map_err(|err| NotifyError::Provider(err.to_string()))?;
        Ok(ReportBundle::new(rows, total))
    }

    async fn export_sqlite(&self) -> Result<SqliteExport, NotifyError> {
        let path = self
            .export_dir
            .join(format!("report-{}.sqlite", Utc::now().timestamp()));
        let size_bytes = {
            let store = self.store.lock().await;
            store
                .export_reports_sqlite(&path)
                .map_err(|err| NotifyError::Provider(err.to_string()))?
        };
        Ok(SqliteExport { path, size_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atc_storage::LocalStore;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn shared_store() -> SharedStore {
        Arc::new(Mutex::new(
            LocalStore::open_in_memory("%Y-%m-%d %H:%M:%S").expect("open store"),
        ))
    }

    #[tokio::test]
    async fn progress_on_an_empty_store_says_so() {
        let providers = StoreProviders::new(shared_store(), std::env::temp_dir());
        let text = providers.progress().await.expect("progress");
        assert_eq!(text, "No attachment records in the local store yet.");
    }

    #[tokio::test]
    async fn progress_formats_processed_share() {
        use atc_core::model::Attachment;
        use chrono::TimeZone;

        let store = shared_store();
        {
            let ts = chrono::Utc
                .with_ymd_and_hms(2026, 3, 1, 0, 0, 0)
                .single()
                .expect("ts");
            let batch: Vec<Attachment> = (1..=4)
                .map(|id| {
                    Attachment::from_catalog_row(
                        id,
                        format!("f{id}"),
                        1,
                        None,
                        1,
                        1,
                        "PRG",
                        "Programs".to_string(),
                        ts,
                        ts,
                    )
                })
                .collect();
            let mut guard = store.lock().await;
            guard.save_attachments(&batch).expect("save");
            guard.mark_processed(&[1]).expect("mark");
        }

        let providers = StoreProviders::new(store, std::env::temp_dir());
        let text = providers.progress().await.expect("progress");
        assert_eq!(text, "Processed 1 of 4 attachments (25.00 %)");
    }
}
