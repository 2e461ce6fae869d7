use chrono::{DateTime, Utc};

/// Bucket of 10,000 sequential issue numbers used in the on-disk attachment
/// layout: issue numbers 1..=10000 land in bucket 10000, 10001..=20000 in
/// bucket 20000, and so on.
pub fn bucket(issue_number: i64) -> i64 {
    ((issue_number - 1) / 10_000 + 1) * 10_000
}

/// One attachment row mirrored from the catalog.
///
/// `issue_key` and `relative_path` are derived from the catalog row in
/// [`Attachment::from_catalog_row`] and nowhere else, so the stored values can
/// never disagree with the (project_key, issue_number, id) triple they came
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    pub filename: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub issue_number: i64,
    pub issue_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub project_id: i64,
    pub project_name: String,
    pub relative_path: String,
    pub processed: bool,
}

impl Attachment {
    #[allow(clippy::too_many_arguments)]
    pub fn from_catalog_row(
        id: i64,
        filename: String,
        file_size: i64,
        mime_type: Option<String>,
        issue_number: i64,
        project_id: i64,
        project_key: &str,
        project_name: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let issue_key = format!("{project_key}-{issue_number}");
        let relative_path = format!(
            "{project_key}/{}/{issue_key}/{id}",
            bucket(issue_number)
        );
        Self {
            id,
            filename,
            file_size,
            mime_type,
            issue_number,
            issue_key,
            created_at,
            updated_at,
            project_id,
            project_name,
            relative_path,
            processed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket(1), 10_000);
        assert_eq!(bucket(11), 10_000);
        assert_eq!(bucket(9_999), 10_000);
        assert_eq!(bucket(10_000), 10_000);
        assert_eq!(bucket(10_001), 20_000);
        assert_eq!(bucket(20_000), 20_000);
        assert_eq!(bucket(20_001), 30_000);
    }

    #[test]
    fn bucket_is_monotonic() {
        let mut previous = bucket(1);
        for issue_number in 2..=30_005 {
            let current = bucket(issue_number);
            assert!(current >= previous, "bucket regressed at {issue_number}");
            previous = current;
        }
    }

    #[test]
    fn derived_path_joins_project_bucket_issue_and_id() {
        let attachment = Attachment::from_catalog_row(
            42,
            "diagram.png".to_string(),
            1_024,
            Some("image/png".to_string()),
            11,
            7,
            "PRG",
            "Programs".to_string(),
            ts(),
            ts(),
        );

        assert_eq!(attachment.issue_key, "PRG-11");
        assert_eq!(attachment.relative_path, "PRG/10000/PRG-11/42");
        assert!(!attachment.processed);
    }

    #[test]
    fn derived_path_crosses_bucket_boundary() {
        let attachment = Attachment::from_catalog_row(
            9,
            "log.txt".to_string(),
            5,
            None,
            10_001,
            3,
            "OPS",
            "Operations".to_string(),
            ts(),
            ts(),
        );

        assert_eq!(attachment.relative_path, "OPS/20000/OPS-10001/9");
    }
}
