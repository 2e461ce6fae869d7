pub mod checker;
pub mod model;
pub mod report;

pub use checker::{check_file_status, ExpectedOwnership, FileStatus};
pub use model::{bucket, Attachment};
pub use report::{ReportBundle, ReportRow, ReportSummary, REPORT_COLUMNS};
