use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::model::Attachment;

/// Expected ownership and permission bits for every attachment on disk.
/// `mode` holds the last three octal digits, e.g. `"644"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOwnership {
    pub uid: u32,
    pub gid: u32,
    pub mode: String,
}

/// Outcome flags of one integrity check. Any combination can be set, except
/// that `file_missing` excludes the others (a missing path cannot be stat'ed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatus {
    pub file_missing: bool,
    pub wrong_owner_or_group: bool,
    pub wrong_mode: bool,
    pub wrong_size: bool,
}

impl FileStatus {
    pub fn is_clean(&self) -> bool {
        !(self.file_missing || self.wrong_owner_or_group || self.wrong_mode || self.wrong_size)
    }
}

/// Verify one attachment against the filesystem snapshot at call time.
///
/// Returns the status flags and a comma-joined message ("ok" when clean).
/// A stat failure of any kind is reported as missing; TOCTOU between the
/// stat and later reads is accepted.
pub async fn check_file_status(
    attachment: &Attachment,
    full_path: &Path,
    expected: &ExpectedOwnership,
) -> (FileStatus, String) {
    let mut status = FileStatus::default();
    let mut clauses: Vec<String> = Vec::new();

    match tokio::fs::metadata(full_path).await {
        Err(_) => {
            status.file_missing = true;
            clauses.push("missing".to_string());
        }
        Ok(meta) => {
            let file_uid = meta.uid();
            let file_gid = meta.gid();
            if file_uid != expected.uid {
                status.wrong_owner_or_group = true;
                clauses.push(format!(
                    "expected uid is {} but got {file_uid} instead",
                    expected.uid
                ));
            }
            if file_gid != expected.gid {
                status.wrong_owner_or_group = true;
                clauses.push(format!(
                    "expected gid is {} but got {file_gid} instead",
                    expected.gid
                ));
            }
            let perm = format!("{:03o}", meta.mode() & 0o777);
            if perm != expected.mode {
                status.wrong_mode = true;
                clauses.push(format!(
                    "expected mode is {} but got {perm} instead",
                    expected.mode
                ));
            }
            if meta.len() as i64 != attachment.file_size {
                status.wrong_size = true;
                clauses.push("wrong_size".to_string());
            }
        }
    }

    let message = if clauses.is_empty() {
        "ok".to_string()
    } else {
        clauses.join(",")
    };
    (status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attachment;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn attachment(file_size: i64) -> Attachment {
        Attachment::from_catalog_row(
            1,
            "a.bin".to_string(),
            file_size,
            None,
            1,
            1,
            "PRG",
            "Programs".to_string(),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        )
    }

    fn expected_for(path: &Path, mode: &str) -> ExpectedOwnership {
        let meta = fs::metadata(path).expect("stat fixture");
        ExpectedOwnership {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: mode.to_string(),
        }
    }

    #[tokio::test]
    async fn missing_file_sets_only_the_missing_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent");
        let expected = ExpectedOwnership {
            uid: 0,
            gid: 0,
            mode: "644".to_string(),
        };

        let (status, message) = check_file_status(&attachment(10), &path, &expected).await;

        assert!(status.file_missing);
        assert!(!status.wrong_owner_or_group);
        assert!(!status.wrong_mode);
        assert!(!status.wrong_size);
        assert_eq!(message, "missing");
    }

    #[tokio::test]
    async fn clean_file_reports_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("present");
        fs::write(&path, vec![0u8; 10]).expect("write fixture");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let expected = expected_for(&path, "644");
        let (status, message) = check_file_status(&attachment(10), &path, &expected).await;

        assert!(status.is_clean());
        assert_eq!(message, "ok");
    }

    #[tokio::test]
    async fn wrong_mode_and_size_accumulate_clauses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("present");
        fs::write(&path, vec![0u8; 7]).expect("write fixture");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");

        let expected = expected_for(&path, "644");
        let (status, message) = check_file_status(&attachment(10), &path, &expected).await;

        assert!(!status.file_missing);
        assert!(status.wrong_mode);
        assert!(status.wrong_size);
        assert_eq!(message, "expected mode is 644 but got 600 instead,wrong_size");
    }

    #[tokio::test]
    async fn uid_mismatch_sets_shared_owner_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("present");
        fs::write(&path, vec![0u8; 10]).expect("write fixture");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let mut expected = expected_for(&path, "644");
        let actual_uid = expected.uid;
        expected.uid = actual_uid.wrapping_add(1);

        let (status, message) = check_file_status(&attachment(10), &path, &expected).await;

        assert!(status.wrong_owner_or_group);
        assert!(!status.wrong_mode);
        assert!(!status.wrong_size);
        assert_eq!(
            message,
            format!(
                "expected uid is {} but got {actual_uid} instead",
                expected.uid
            )
        );
    }
}
