use std::io;

/// Errors raised by validation and by a running scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid IP range format: {0}")]
    InvalidRangeFormat(String),

    #[error("invalid port format: {0}")]
    InvalidPortFormat(String),

    #[error("file too large ({size} bytes, maximum {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file is empty")]
    EmptyFile,

    #[error("maximum concurrent scans reached ({limit})")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("no range list uploaded")]
    NoInputFile,

    #[error("failed to start scan engine: {0}")]
    SpawnFailure(#[source] io::Error),

    #[error("scan engine I/O failure: {0}")]
    EngineIo(#[source] io::Error),

    #[error("file storage error: {0}")]
    Storage(#[source] io::Error),
}

/// A transport refused to deliver a message. Always non-fatal for a run.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport delivery failed: {0}")]
pub struct TransportError(pub String);
