use std::path::Path;

use atc_core::checker::FileStatus;
use atc_core::model::Attachment;
use atc_core::report::ReportRow;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

/// Sentinel returned by [`LocalStore::seconds_since_last_launch`] when no
/// mirror pass has ever completed. Callers must treat it as "refresh is due".
pub const NEVER_LAUNCHED: i64 = -1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("store is closed")]
    Closed,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("export io error: {0}")]
    ExportIo(#[from] std::io::Error),
}

/// Processed-versus-total attachment counts backing the /progress command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub processed: i64,
    pub total: i64,
}

/// One verification outcome queued for persistence.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub attachment: Attachment,
    pub full_path: String,
    pub status: FileStatus,
    pub message: String,
}

/// Durable cache of mirrored attachment rows, the launch-time parameter, and
/// verification reports.
///
/// The connection lives behind an `Option` so `close` is idempotent and every
/// operation after close fails with [`StorageError::Closed`] instead of
/// touching a dead handle.
pub struct LocalStore {
    conn: Option<Connection>,
    time_format: String,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>, time_format: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Some(conn),
            time_format: time_format.into(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory(time_format: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Some(conn),
            time_format: time_format.into(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_schema.sql");
            self.conn()?.execute_batch(sql)?;
            self.conn()?
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Insert-or-ignore by attachment id. Existing rows are never updated, so
    /// a later mirror pass cannot clobber a locally flipped `processed` flag.
    /// Returns the number of newly inserted rows.
    pub fn save_attachments(&mut self, batch: &[Attachment]) -> Result<usize, StorageError> {
        let time_format = self.time_format.clone();
        let tx = self.conn_mut()?.transaction()?;
        let mut inserted = 0;
        {
            let mut statement = tx.prepare_cached(
                "
                INSERT OR IGNORE INTO attachments (
                    attachment_id,
                    filename,
                    file_size,
                    mime_type,
                    issue_number,
                    issue_key,
                    created,
                    updated,
                    project_id,
                    project_name,
                    relative_path,
                    processed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
                ",
            )?;
            for attachment in batch {
                inserted += statement.execute(params![
                    attachment.id,
                    attachment.filename,
                    attachment.file_size,
                    attachment.mime_type,
                    attachment.issue_number,
                    attachment.issue_key,
                    attachment.created_at.format(&time_format).to_string(),
                    attachment.updated_at.format(&time_format).to_string(),
                    attachment.project_id,
                    attachment.project_name,
                    attachment.relative_path,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn save_launch_time(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let value = now.format(&self.time_format).to_string();
        self.conn()?.execute(
            "
            INSERT INTO parameters (name, value) VALUES ('launch_time', ?1)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            ",
            [value],
        )?;
        Ok(())
    }

    /// Whole seconds elapsed since the last recorded mirror pass, or
    /// [`NEVER_LAUNCHED`] when none has been recorded yet.
    pub fn seconds_since_last_launch(&self, now: DateTime<Utc>) -> Result<i64, StorageError> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM parameters WHERE name = 'launch_time'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(value) = value else {
            return Ok(NEVER_LAUNCHED);
        };

        let last = self.parse_ts(&value)?;
        Ok((now - last).num_seconds())
    }

    /// Deterministic pagination over rows with processed = 0, ordered by id.
    pub fn unprocessed_attachments(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Attachment>, StorageError> {
        let mut statement = self.conn()?.prepare_cached(
            "
            SELECT attachment_id, filename, file_size, mime_type, issue_number, issue_key,
                   created, updated, project_id, project_name, relative_path, processed
            FROM attachments
            WHERE processed = 0
            ORDER BY attachment_id ASC
            LIMIT ?1 OFFSET ?2
            ",
        )?;

        let time_format = self.time_format.clone();
        let rows = statement.query_map(params![limit, offset], |row| {
            let created: String = row.get(6)?;
            let updated: String = row.get(7)?;
            let created_at = parse_with_format(&created, &time_format).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            let updated_at = parse_with_format(&updated, &time_format).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;

            Ok(Attachment {
                id: row.get(0)?,
                filename: row.get(1)?,
                file_size: row.get(2)?,
                mime_type: row.get(3)?,
                issue_number: row.get(4)?,
                issue_key: row.get(5)?,
                created_at,
                updated_at,
                project_id: row.get(8)?,
                project_name: row.get(9)?,
                relative_path: row.get(10)?,
                processed: row.get::<_, i64>(11)? != 0,
            })
        })?;

        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }

    /// Set processed = 1 for the given ids in one transaction. Repeating the
    /// call is a no-op.
    pub fn mark_processed(&mut self, ids: &[i64]) -> Result<(), StorageError> {
        let tx = self.conn_mut()?.transaction()?;
        {
            let mut statement =
                tx.prepare_cached("UPDATE attachments SET processed = 1 WHERE attachment_id = ?1")?;
            for id in ids {
                statement.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert-or-ignore by attachment id: the first verification of an
    /// attachment wins unless its report is explicitly cleared.
    pub fn save_attachment_reports(&mut self, entries: &[ReportEntry]) -> Result<(), StorageError> {
        let time_format = self.time_format.clone();
        let tx = self.conn_mut()?.transaction()?;
        {
            let mut statement = tx.prepare_cached(
                "
                INSERT OR IGNORE INTO reports (
                    attachment_id,
                    filename,
                    full_path,
                    project_name,
                    issue_key,
                    created,
                    updated,
                    file_missing,
                    wrong_owner_or_group,
                    wrong_mode,
                    wrong_size,
                    status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ",
            )?;
            for entry in entries {
                statement.execute(params![
                    entry.attachment.id,
                    entry.attachment.filename,
                    entry.full_path,
                    entry.attachment.project_name,
                    entry.attachment.issue_key,
                    entry.attachment.created_at.format(&time_format).to_string(),
                    entry.attachment.updated_at.format(&time_format).to_string(),
                    entry.status.file_missing as i64,
                    entry.status.wrong_owner_or_group as i64,
                    entry.status.wrong_mode as i64,
                    entry.status.wrong_size as i64,
                    entry.message,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn reports_full(&self) -> Result<Vec<ReportRow>, StorageError> {
        self.query_reports(
            "
            SELECT attachment_id, filename, full_path, project_name, issue_key, created, updated,
                   file_missing, wrong_owner_or_group, wrong_mode, wrong_size, status
            FROM reports
            ORDER BY attachment_id ASC
            ",
        )
    }

    /// Only rows with at least one flag set.
    pub fn reports_short(&self) -> Result<Vec<ReportRow>, StorageError> {
        self.query_reports(
            "
            SELECT attachment_id, filename, full_path, project_name, issue_key, created, updated,
                   file_missing, wrong_owner_or_group, wrong_mode, wrong_size, status
            FROM reports
            WHERE file_missing = 1
               OR wrong_owner_or_group = 1
               OR wrong_mode = 1
               OR wrong_size = 1
            ORDER BY attachment_id ASC
            ",
        )
    }

    fn query_reports(&self, sql: &str) -> Result<Vec<ReportRow>, StorageError> {
        let mut statement = self.conn()?.prepare(sql)?;
        let rows = statement.query_map([], |row| {
            Ok(ReportRow {
                attachment_id: row.get(0)?,
                filename: row.get(1)?,
                full_path: row.get(2)?,
                project_name: row.get(3)?,
                issue_key: row.get(4)?,
                created: row.get(5)?,
                updated: row.get(6)?,
                status: FileStatus {
                    file_missing: row.get::<_, i64>(7)? != 0,
                    wrong_owner_or_group: row.get::<_, i64>(8)? != 0,
                    wrong_mode: row.get::<_, i64>(9)? != 0,
                    wrong_size: row.get::<_, i64>(10)? != 0,
                },
                message: row.get(11)?,
            })
        })?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?);
        }
        Ok(reports)
    }

    pub fn total_attachments(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?)
    }

    pub fn progress_counts(&self) -> Result<ProgressCounts, StorageError> {
        let mut statement = self
            .conn()?
            .prepare("SELECT processed, COUNT(*) FROM attachments GROUP BY processed")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = ProgressCounts::default();
        for row in rows {
            let (processed, count) = row?;
            counts.total += count;
            if processed != 0 {
                counts.processed += count;
            }
        }
        Ok(counts)
    }

    /// Materialize the reports into a freshly created sqlite file at `dest`
    /// and return its size in bytes. The alternate export path for payloads
    /// the delimited format cannot carry in one message.
    pub fn export_reports_sqlite(&self, dest: &Path) -> Result<u64, StorageError> {
        let rows = self.reports_full()?;

        let mut export = Connection::open(dest)?;
        export.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS reports (
                attachment_id        INTEGER PRIMARY KEY,
                filename             TEXT NOT NULL,
                full_path            TEXT NOT NULL,
                project_name         TEXT NOT NULL,
                issue_key            TEXT NOT NULL,
                created              TEXT NOT NULL,
                updated              TEXT NOT NULL,
                file_missing         INTEGER NOT NULL DEFAULT 0,
                wrong_owner_or_group INTEGER NOT NULL DEFAULT 0,
                wrong_mode           INTEGER NOT NULL DEFAULT 0,
                wrong_size           INTEGER NOT NULL DEFAULT 0,
                status               TEXT NOT NULL
            );
            ",
        )?;

        let tx = export.transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT OR REPLACE INTO reports (
                    attachment_id, filename, full_path, project_name, issue_key,
                    created, updated, file_missing, wrong_owner_or_group,
                    wrong_mode, wrong_size, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ",
            )?;
            for row in &rows {
                statement.execute(params![
                    row.attachment_id,
                    row.filename,
                    row.full_path,
                    row.project_name,
                    row.issue_key,
                    row.created,
                    row.updated,
                    row.status.file_missing as i64,
                    row.status.wrong_owner_or_group as i64,
                    row.status.wrong_mode as i64,
                    row.status.wrong_size as i64,
                    row.message,
                ])?;
            }
        }
        tx.commit()?;
        if let Err((_, err)) = export.close() {
            return Err(StorageError::Sqlite(err));
        }

        Ok(std::fs::metadata(dest)?.len())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()?
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Release the underlying connection. Safe to call more than once; close
    /// failures during teardown are swallowed.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn parse_ts(&self, value: &str) -> Result<DateTime<Utc>, StorageError> {
        parse_with_format(value, &self.time_format)
    }
}

fn parse_with_format(value: &str, format: &str) -> Result<DateTime<Utc>, StorageError> {
    let naive = NaiveDateTime::parse_from_str(value, format)
        .map_err(|err| StorageError::Timestamp(format!("{value:?}: {err}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}
