//! Error types for the backup engine.
//!
//! Split by the failure tiers in the error handling design: a digest-level
//! error, a per-file pipeline error, and a session/precondition-level engine
//! error that wraps the others.

use thiserror::Error;
use std::path::PathBuf;

/// Errors raised by the digest engine (§4.1).
#[derive(Error, Debug)]
pub enum DigestError {
    #[error("file not found: {0}")]
    FileMissing(PathBuf),

    #[error("file not readable: {0}")]
    NotReadable(PathBuf),

    #[error("file is an offline placeholder (not materialised locally): {0}")]
    OfflinePlaceholder(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Classification of an I/O failure for the pipeline's retry policy (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection loss, EAGAIN, host-unreachable and the like on
    /// network volumes — retried with backoff.
    Transient,
    /// Checksum mismatches, cancellation, and anything else — never retried.
    Permanent,
}

/// Errors raised by a single (file, destination) pipeline run (§4.4, §7 PerFile).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(#[source] DigestError),

    #[error("copy I/O error: {message}")]
    CopyIo { message: String, class: FailureClass },

    #[error("quarantine move failed: {0}")]
    QuarantineFailed(String),

    #[error("checksum mismatch after copy")]
    VerifyMismatch,

    #[error("flush error: {message}")]
    FlushError { message: String, class: FailureClass },

    #[error("cancelled")]
    Cancelled,

    #[error("network timeout")]
    NetworkTimeout,
}

impl PipelineError {
    pub fn copy_io(e: std::io::Error) -> Self {
        PipelineError::CopyIo {
            class: classify_io_kind(e.kind()),
            message: e.to_string(),
        }
    }

    pub fn flush_error(e: std::io::Error) -> Self {
        PipelineError::FlushError {
            class: classify_io_kind(e.kind()),
            message: e.to_string(),
        }
    }

    /// The reason string recorded on the `FAILED` action record (§3, §4.4).
    pub fn reason(&self) -> String {
        match self {
            PipelineError::SourceUnreadable(e) => format!("Source unreadable: {e}"),
            PipelineError::CopyIo { message, .. } => format!("Copy error: {message}"),
            PipelineError::QuarantineFailed(msg) => format!("Quarantine failed: {msg}"),
            PipelineError::VerifyMismatch => "Checksum mismatch after copy".to_string(),
            PipelineError::FlushError { message, .. } => format!("Flush error: {message}"),
            PipelineError::Cancelled => "Cancelled".to_string(),
            PipelineError::NetworkTimeout => "NetworkTimeout".to_string(),
        }
    }

    /// Whether this error class is eligible for the bounded retry in §4.4.
    pub fn classify(&self) -> FailureClass {
        match self {
            PipelineError::CopyIo { class, .. } | PipelineError::FlushError { class, .. } => *class,
            _ => FailureClass::Permanent,
        }
    }
}

/// Classifies an I/O error kind per spec.md §4.4's transient list: timeouts,
/// connection loss, EAGAIN (`WouldBlock`), and the analogous "unknown error"
/// classes on network volumes are retried; anything else (permission denied,
/// not found, disk full, invalid data) is permanent and never retried.
pub fn classify_io_kind(kind: std::io::ErrorKind) -> FailureClass {
    use std::io::ErrorKind::*;
    match kind {
        TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused | NotConnected
        | WouldBlock | BrokenPipe | Interrupted | UnexpectedEof => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Top-level engine error (§7 Precondition and Session tiers).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn transient_kinds_are_retried() {
        assert_eq!(classify_io_kind(ErrorKind::TimedOut), FailureClass::Transient);
        assert_eq!(classify_io_kind(ErrorKind::ConnectionReset), FailureClass::Transient);
        assert_eq!(classify_io_kind(ErrorKind::WouldBlock), FailureClass::Transient);
    }

    #[test]
    fn permanent_kinds_are_never_retried() {
        assert_eq!(classify_io_kind(ErrorKind::PermissionDenied), FailureClass::Permanent);
        assert_eq!(classify_io_kind(ErrorKind::NotFound), FailureClass::Permanent);
        assert_eq!(classify_io_kind(ErrorKind::InvalidData), FailureClass::Permanent);
    }

    #[test]
    fn verify_mismatch_and_cancelled_are_never_retried() {
        assert_eq!(PipelineError::VerifyMismatch.classify(), FailureClass::Permanent);
        assert_eq!(PipelineError::Cancelled.classify(), FailureClass::Permanent);
    }
}
