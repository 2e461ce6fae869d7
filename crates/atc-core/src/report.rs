use std::fmt;

use crate::checker::FileStatus;

/// Column order of the full export and of the `reports` table.
pub const REPORT_COLUMNS: [&str; 12] = [
    "attachment_id",
    "filename",
    "full_path",
    "project_name",
    "issue_key",
    "created",
    "updated",
    "file_missing",
    "wrong_owner_or_group",
    "wrong_mode",
    "wrong_size",
    "status",
];

/// One persisted verification result. Timestamps stay in the configured
/// text format they were stored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub attachment_id: i64,
    pub filename: String,
    pub full_path: String,
    pub project_name: String,
    pub issue_key: String,
    pub created: String,
    pub updated: String,
    pub status: FileStatus,
    pub message: String,
}

impl ReportRow {
    pub fn to_delimited(&self, delimiter: char) -> String {
        let fields = [
            self.attachment_id.to_string(),
            self.filename.clone(),
            self.full_path.clone(),
            self.project_name.clone(),
            self.issue_key.clone(),
            self.created.clone(),
            self.updated.clone(),
            flag_digit(self.status.file_missing),
            flag_digit(self.status.wrong_owner_or_group),
            flag_digit(self.status.wrong_mode),
            flag_digit(self.status.wrong_size),
            self.message.clone(),
        ];
        fields.join(&delimiter.to_string())
    }
}

fn flag_digit(flag: bool) -> String {
    if flag { "1" } else { "0" }.to_string()
}

/// Aggregate statistics over the stored reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub total_attachments: i64,
    pub total_reports: i64,
    pub clean: i64,
    pub file_missing: i64,
    pub wrong_owner_or_group: i64,
    pub wrong_mode: i64,
    pub wrong_size: i64,
}

impl ReportSummary {
    pub fn from_rows(rows: &[ReportRow], total_attachments: i64) -> Self {
        let mut summary = Self {
            total_attachments,
            total_reports: rows.len() as i64,
            ..Self::default()
        };
        for row in rows {
            if row.status.is_clean() {
                summary.clean += 1;
            }
            if row.status.file_missing {
                summary.file_missing += 1;
            }
            if row.status.wrong_owner_or_group {
                summary.wrong_owner_or_group += 1;
            }
            if row.status.wrong_mode {
                summary.wrong_mode += 1;
            }
            if row.status.wrong_size {
                summary.wrong_size += 1;
            }
        }
        summary
    }
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} attachments verified: {} ok, {} missing, {} wrong owner/group, {} wrong mode, {} wrong size",
            self.total_reports,
            self.total_attachments,
            self.clean,
            self.file_missing,
            self.wrong_owner_or_group,
            self.wrong_mode,
            self.wrong_size,
        )
    }
}

/// Cached per-session report data: columns and rows are computed once when a
/// report dialog starts; only the rendering depends on the requested format.
#[derive(Debug, Clone)]
pub struct ReportBundle {
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
    pub summary: ReportSummary,
}

impl ReportBundle {
    pub fn new(rows: Vec<ReportRow>, total_attachments: i64) -> Self {
        let summary = ReportSummary::from_rows(&rows, total_attachments);
        Self {
            columns: REPORT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
            summary,
        }
    }

    pub fn header_line(&self, delimiter: char) -> String {
        self.columns.join(&delimiter.to_string())
    }

    pub fn render_csv(&self, delimiter: char) -> String {
        let mut out = self.header_line(delimiter);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.to_delimited(delimiter));
            out.push('\n');
        }
        out
    }
}

/// Split rendered rows into transport-sized parts.
///
/// Each part begins with its own header line so it is independently readable.
/// Rows are appended greedily while the part stays within
/// `transport_limit - safety_margin`; the final partial part is always
/// emitted. Concatenating the data rows of all parts reproduces the input
/// sequence, and every part is at most `transport_limit` bytes as long as a
/// single row fits the window.
pub fn split_into_parts(
    header: &str,
    rows: &[String],
    transport_limit: usize,
    safety_margin: usize,
) -> Vec<String> {
    let threshold = transport_limit.saturating_sub(safety_margin);
    let mut parts = Vec::new();
    let mut chunk = format!("{header}\n");
    let mut chunk_has_rows = false;

    for row in rows {
        let appended_len = chunk.len() + row.len() + 1;
        if chunk_has_rows && appended_len > threshold {
            parts.push(chunk);
            chunk = format!("{header}\n");
            chunk_has_rows = false;
        }
        chunk.push_str(row);
        chunk.push('\n');
        chunk_has_rows = true;
    }
    parts.push(chunk);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, status: FileStatus, message: &str) -> ReportRow {
        ReportRow {
            attachment_id: id,
            filename: format!("file-{id}.bin"),
            full_path: format!("/data/PRG/10000/PRG-1/{id}"),
            project_name: "Programs".to_string(),
            issue_key: "PRG-1".to_string(),
            created: "2026-03-01 10:00:00".to_string(),
            updated: "2026-03-01 10:00:00".to_string(),
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn delimited_row_uses_configured_delimiter_and_flag_digits() {
        let status = FileStatus {
            file_missing: true,
            ..FileStatus::default()
        };
        let line = row(7, status, "missing").to_delimited(';');
        assert_eq!(
            line,
            "7;file-7.bin;/data/PRG/10000/PRG-1/7;Programs;PRG-1;\
             2026-03-01 10:00:00;2026-03-01 10:00:00;1;0;0;0;missing"
        );
    }

    #[test]
    fn summary_counts_each_flag_independently() {
        let rows = vec![
            row(1, FileStatus::default(), "ok"),
            row(
                2,
                FileStatus {
                    file_missing: true,
                    ..FileStatus::default()
                },
                "missing",
            ),
            row(
                3,
                FileStatus {
                    wrong_mode: true,
                    wrong_size: true,
                    ..FileStatus::default()
                },
                "expected mode is 644 but got 600 instead,wrong_size",
            ),
        ];
        let summary = ReportSummary::from_rows(&rows, 5);

        assert_eq!(summary.total_attachments, 5);
        assert_eq!(summary.total_reports, 3);
        assert_eq!(summary.clean, 1);
        assert_eq!(summary.file_missing, 1);
        assert_eq!(summary.wrong_mode, 1);
        assert_eq!(summary.wrong_size, 1);
        assert_eq!(summary.wrong_owner_or_group, 0);
    }

    #[test]
    fn rendered_csv_starts_with_header_and_keeps_row_order() {
        let bundle = ReportBundle::new(
            vec![row(1, FileStatus::default(), "ok"), row(2, FileStatus::default(), "ok")],
            2,
        );
        let csv = bundle.render_csv(';');
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(bundle.header_line(';').as_str()));
        assert!(lines.next().unwrap().starts_with("1;"));
        assert!(lines.next().unwrap().starts_with("2;"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn parts_reassemble_to_original_rows_and_respect_the_limit() {
        // header line is 10 bytes with the newline, rows 100 bytes each with
        // the newline; threshold 900 leaves room for 8 rows per part.
        let header = "h".repeat(9);
        let rows: Vec<String> = (0..20)
            .map(|i| format!("{i:02}{}", "x".repeat(97)))
            .collect();

        let parts = split_into_parts(&header, &rows, 1_000, 100);

        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert!(part.len() <= 1_000);
            assert!(part.starts_with(&format!("{header}\n")));
        }

        let reassembled: Vec<String> = parts
            .iter()
            .flat_map(|part| part.lines().skip(1).map(|line| line.to_string()))
            .collect();
        assert_eq!(reassembled, rows);
    }

    #[test]
    fn final_partial_part_is_emitted_even_under_threshold() {
        let header = "id".to_string();
        let rows = vec!["a".to_string(), "b".to_string()];
        let parts = split_into_parts(&header, &rows, 1_000_000, 15_000);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], "id\na\nb\n");
    }

    #[test]
    fn empty_report_still_produces_a_header_only_part() {
        let parts = split_into_parts("id", &[], 100, 10);
        assert_eq!(parts, vec!["id\n".to_string()]);
    }

    #[test]
    fn uniform_rows_split_into_the_expected_part_count() {
        // 50 uniform rows of 40 bytes (with newline) against a 210-byte data
        // window per part: 5 rows per part, so exactly 10 parts.
        let header = "hhhh".to_string(); // 5 bytes with newline
        let rows: Vec<String> = (0..50).map(|i| format!("{i:03}{}", "y".repeat(36))).collect();
        let parts = split_into_parts(&header, &rows, 235, 20);
        assert_eq!(parts.len(), 10);
    }
}
