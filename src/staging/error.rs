//! Pipeline error taxonomy

use super::kind::{RecordKind, Stage};
use std::io::Error as IoError;

/// Error type for staging and delivery operations
///
/// Every variant is recoverable from the pipeline's point of view: a failing
/// record or cycle is logged and retried later, never escalated.
#[derive(Debug)]
pub enum PipelineError {
    /// Directory or file operation failed
    Io(IoError),
    /// Staged filename (or owner/URI) does not follow the naming grammar
    Format(String),
    /// Object store write failed; the artifact stays in Uploading
    Upload { key: String, source: IoError },
    /// Configuration is invalid (fatal at startup only)
    Config(String),
    /// The kind has no such stage (e.g. specimen has no Aggregating)
    InvalidStage { kind: RecordKind, stage: Stage },
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Io(e) => write!(f, "I/O error: {}", e),
            PipelineError::Format(msg) => write!(f, "Format error: {}", msg),
            PipelineError::Upload { key, source } => {
                write!(f, "Upload of {} failed: {}", key, source)
            }
            PipelineError::Config(msg) => write!(f, "Config error: {}", msg),
            PipelineError::InvalidStage { kind, stage } => {
                write!(f, "Kind {} has no {} stage", kind, stage)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(e) => Some(e),
            PipelineError::Upload { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<IoError> for PipelineError {
    fn from(e: IoError) -> Self {
        PipelineError::Io(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Format(format!("JSON: {}", e))
    }
}

impl PipelineError {
    pub fn is_upload(&self) -> bool {
        matches!(self, PipelineError::Upload { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
