//! Unified error model for crash analysis.
use thiserror::Error;

use crate::types::DumpKind;

#[derive(Error, Debug)]
pub enum CrashError {
    #[error("BACKEND/{0}")]
    Backend(String),

    #[error("TICKET/{0}")]
    Ticketing(String),

    #[error("REPORT/{0}")]
    Reporter(String),

    #[error("TIME/cannot parse '{value}' as {format}")]
    Timestamp { value: String, format: String },

    #[error("CONFIG/{0}")]
    Config(String),

    #[error("DOWNLOAD/{kind} {id}: {reason}")]
    Download {
        kind: DumpKind,
        id: String,
        reason: String,
    },

    #[error("CANCELLED/{0}")]
    Cancelled(String),

    #[error("DEADLINE/{operation} exceeded {secs}s")]
    Deadline { operation: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CrashResult<T> = Result<T, CrashError>;
