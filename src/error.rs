//! Error kinds the core distinguishes, per the propagation policy:
//! recoverable faults are absorbed where they occur; `QueueClosed` and
//! `DetectorFault` propagate by tripping a pipeline's `quit` flag.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stream index exhausted")]
    SourceExhausted,

    #[error("failed to open decoder for {path}: {source}")]
    DecoderOpenFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("read failed mid-stream for {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("channel closed during shutdown")]
    QueueClosed,

    #[error("tile detector ({row},{col}) faulted: {source}")]
    DetectorFault {
        row: usize,
        col: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("filesystem fault at {path}: {source}")]
    FilesystemFault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
