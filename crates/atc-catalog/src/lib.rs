use async_trait::async_trait;
use atc_core::model::Attachment;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Read-only paginated access to the authoritative attachment catalog.
///
/// `fetch_attachments` must return the same rows for the same offset under a
/// static dataset; an empty page signals end-of-data. Connectivity errors
/// propagate unchanged and abort the current mirror pass.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn fetch_attachments(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Attachment>, CatalogError>;

    /// Release the catalog connection. Must be safe to call once per run.
    async fn close(&self);
}

/// Catalog reader over the issue tracker's Postgres schema: one join of
/// fileattachment, jiraissue, and project per page.
pub struct PgCatalogReader {
    pool: PgPool,
}

const FETCH_ATTACHMENTS_SQL: &str = "
    SELECT fa.id::bigint            AS attachment_id,
           fa.filename              AS filename,
           fa.filesize::bigint      AS file_size,
           fa.mimetype              AS mime_type,
           ji.issuenum::bigint      AS issue_number,
           ji.created               AS created,
           ji.updated               AS updated,
           p.id::bigint             AS project_id,
           p.pkey                   AS project_key,
           p.pname                  AS project_name
    FROM fileattachment fa
    JOIN jiraissue ji ON ji.id = fa.issueid
    JOIN project p ON p.id = ji.project
    ORDER BY fa.id
    LIMIT $1 OFFSET $2
";

impl PgCatalogReader {
    pub async fn connect(dsn: &str) -> Result<Self, CatalogError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(dsn).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CatalogReader for PgCatalogReader {
    async fn fetch_attachments(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Attachment>, CatalogError> {
        debug!(offset, limit, "fetching attachment page from catalog");
        let rows = sqlx::query(FETCH_ATTACHMENTS_SQL)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let mut attachments = Vec::with_capacity(rows.len());
        for row in rows {
            // a NULL in any joined column is a data inconsistency and fails
            // the whole fetch
            let project_key: String = row.try_get("project_key")?;
            attachments.push(Attachment::from_catalog_row(
                row.try_get::<i64, _>("attachment_id")?,
                row.try_get("filename")?,
                row.try_get::<i64, _>("file_size")?,
                row.try_get::<Option<String>, _>("mime_type")?,
                row.try_get::<i64, _>("issue_number")?,
                row.try_get::<i64, _>("project_id")?,
                &project_key,
                row.try_get("project_name")?,
                row.try_get::<DateTime<Utc>, _>("created")?,
                row.try_get::<DateTime<Utc>, _>("updated")?,
            ));
        }
        Ok(attachments)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
