//! Error kinds shared by every actor and adapter in the pipeline.
//!
//! Adapters (the Redis broker, the Postgres cold store) define their own
//! `thiserror` error enums for their backend-specific failure modes and
//! convert into [`Error`] at the trait boundary they implement, so that no
//! raw underlying-library error ever crosses into the core.

use std::fmt;

/// Coarse classification of an [`Error`], used by actors to decide whether
/// to retry, drop-and-log, or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or storage failure expected to clear up on retry.
    Transient,
    /// A record failed to decode from its wire or row representation.
    MalformedRecord,
    /// A constraint violation or other non-retryable failure.
    Permanent,
    /// Cancellation was observed; the caller should unwind cleanly.
    ShuttingDown,
    /// Invalid configuration detected before any loop started.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::MalformedRecord => "malformed_record",
            ErrorKind::Permanent => "permanent",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// Error type shared by the broker adapter, cold store adapter, rule
/// engine, worker, and archiver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network / retryable storage failure. The caller should retry with
    /// exponential backoff.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// A record failed to decode (missing field, bad numeric parse, bad
    /// timestamp, bad id, or invalid embedded JSON).
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A constraint violation, or other failure that will not clear up on
    /// retry, other than the benign archival-checkpoint race (which is
    /// handled internally and never surfaces as an error).
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),

    /// Cancellation was observed between iterations or at a blocking call's
    /// timeout boundary.
    #[error("shutting down")]
    ShuttingDown,

    /// Invalid configuration detected at startup, before any loop runs.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns the coarse [`ErrorKind`] of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) => ErrorKind::Transient,
            Error::MalformedRecord(_) => ErrorKind::MalformedRecord,
            Error::Permanent(_) => ErrorKind::Permanent,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// True if the actor that produced this error should retry the
    /// operation after a backoff, rather than dropping the unit of work or
    /// aborting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Shorthand for constructing a [`Error::MalformedRecord`] with a
    /// formatted message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedRecord(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
