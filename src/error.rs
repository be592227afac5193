use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("admin set not found in record store: {0}")]
    #[diagnostic(help("create it first with `pubmed-ingest admin-set create`"))]
    MissingAdminSet(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("no checkpoint to resume from at {0}")]
    #[diagnostic(help("start a fresh run without --resume, or point --output-dir at an existing run"))]
    MissingCheckpoint(PathBuf),

    #[error("output directory already holds a run: {0}")]
    #[diagnostic(help("pass --resume to continue it, or choose another --output-dir"))]
    RunExists(PathBuf),

    #[error("failed to parse checkpoint: {0}")]
    CheckpointParse(String),

    #[error("invalid identifier record: {0}")]
    InvalidIdentifier(String),

    #[error("NCBI request failed: {0}")]
    NcbiHttp(String),

    #[error("NCBI returned status {status}: {message}")]
    NcbiStatus { status: u16, message: String },

    #[error("file transfer failed: {0}")]
    TransferHttp(String),

    #[error("file transfer returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("work not found: {0}")]
    WorkNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("stage did not finish, resume to continue: {0}")]
    StageIncomplete(String),

    #[error("failed to send summary: {0}")]
    Notification(String),
}

impl IngestError {
    /// Network and API failures that leave the current page or batch safe to
    /// retry on the next run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::NcbiHttp(_)
                | IngestError::NcbiStatus { .. }
                | IngestError::TransferHttp(_)
                | IngestError::TransferStatus { .. }
        )
    }
}
