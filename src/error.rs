// Error taxonomy shared by every pipeline stage.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} was not found")]
    BinaryNotFound(String),

    #[error("{} is not executable", .0.display())]
    BinaryNotExecutable(PathBuf),

    #[error("Failed to start {program}: {source}")]
    ProcessFailedToStart {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {}ms", .timeout.as_millis())]
    ProcessTimedOut { program: String, timeout: Duration },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("No frame count found while probing {}", .0.display())]
    ProbeParseFailed(PathBuf),

    #[error("Conversion exited early: {written}/{expected} files written")]
    PartialConversion { written: usize, expected: usize },

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Unable to clear workspace {} ({remaining} entries left)", .path.display())]
    WorkspaceCleanupFailed { path: PathBuf, remaining: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::UserCancelled)
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
