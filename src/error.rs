//! Error taxonomy for the aggregation engine.
//!
//! Record-level problems ([`RecordError`]) never unwind a run: they are counted
//! and the record is dropped. A source file that cannot be read produces a
//! [`FileAccessError`] that is reported alongside the results. Only
//! [`RunError`] aborts a run, and when it does nothing is written.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::aggregation::schema::CanonicalField;

/// Why a single record was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// A required field could not be recovered for this record, either
    /// because no column (canonical or alternate) exists or its value is null.
    #[error("required field `{0}` is missing")]
    Schema(CanonicalField),

    /// The pickup timestamp is null or cannot be parsed.
    #[error("pickup timestamp is invalid")]
    InvalidTimestamp,
}

/// A source file that could not be opened or streamed to completion.
///
/// The file's contribution is absent from the run; already merged files are
/// unaffected.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileAccessError {
    #[error("failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("failed reading {path} after {chunks} chunks: {reason}")]
    Read {
        path: PathBuf,
        chunks: usize,
        reason: String,
    },

    #[error("{path} did not finish within {secs}s")]
    Timeout { path: PathBuf, secs: u64 },

    #[error("worker for {path} aborted: {reason}")]
    Worker { path: PathBuf, reason: String },
}

impl FileAccessError {
    pub fn path(&self) -> &PathBuf {
        match self {
            FileAccessError::Open { path, .. }
            | FileAccessError::Read { path, .. }
            | FileAccessError::Timeout { path, .. }
            | FileAccessError::Worker { path, .. } => path,
        }
    }
}

/// Errors that end a run without producing output.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    FatalConfig(String),

    #[error("run cancelled")]
    Cancelled,
}
