use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::coordinator::IngestReport;
use crate::domain::OutcomeCategory;
use crate::error::IngestError;
use crate::fs_util::write_atomic;

/// Delivery of the end-of-run summary.
pub trait Notifier: Send + Sync {
    fn send_summary(&self, report: &IngestReport) -> Result<(), IngestError>;
}

/// Writes the summary as plain text into the run directory.
#[derive(Debug, Clone)]
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Notifier for FileNotifier {
    fn send_summary(&self, report: &IngestReport) -> Result<(), IngestError> {
        write_atomic(&self.path, render_summary(report).as_bytes())
            .map_err(|err| IngestError::Notification(err.to_string()))?;
        info!(path = %self.path.display(), "summary written");
        Ok(())
    }
}

pub fn render_summary(report: &IngestReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "PubMed ingest summary");
    let _ = writeln!(
        out,
        "Publication dates: {} to {}",
        report.start_date, report.end_date
    );
    let _ = writeln!(out, "Admin set: {}", report.admin_set_title);
    let _ = writeln!(out, "Generated: {}", report.generated_at);
    let _ = writeln!(out, "Total unique records: {}", report.total_unique_records);
    let _ = writeln!(out);
    for category in OutcomeCategory::ALL {
        let _ = writeln!(out, "{category}: {}", report.count(category));
    }

    let failed = report.records(OutcomeCategory::Failed);
    if !failed.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failures:");
        for record in failed {
            let _ = writeln!(out, "  {} - {}", record.ids.label(), record.message);
        }
    }
    out
}
