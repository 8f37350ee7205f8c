//! Tagged error taxonomy for command execution.
//!
//! The original engine this crate's dispatcher is modeled on raised two
//! exception kinds at the execution-step boundary and let the dispatcher
//! catch them by pointer type. Here the same contract is a typed return
//! value: a step either succeeds or raises one of [`DlError::Retry`],
//! [`DlError::Abort`], or [`DlError::Fatal`], and the dispatcher decides
//! what happens next based on the variant alone.

use thiserror::Error;

/// The outcome of a command's execution step when it cannot simply continue.
#[derive(Debug, Error)]
pub enum DlError {
    /// Transient failure: I/O timeout, unexpected EOF mid-body, a
    /// recoverable protocol parse error. The dispatcher increments the
    /// request's try-count and, if under `max_tries`, schedules a fresh
    /// connection command after `retry_wait` seconds.
    #[error("retry: {0}")]
    Retry(String),

    /// Fatal request-level failure: permanent DNS failure, authentication
    /// rejection, a 4xx status, a protocol violation. The dispatcher cancels
    /// the segment, charges one error against the segment manager, and
    /// consumes one reserved request if present.
    #[error("abort: {0}")]
    Abort(String),

    /// Structural failure that the engine cannot recover from at all:
    /// malformed metainfo, a full disk, or an explicit halt. Propagates out
    /// of the dispatcher's run loop.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DlError {
    pub fn retry(reason: impl Into<String>) -> Self {
        DlError::Retry(reason.into())
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        DlError::Abort(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        DlError::Fatal(reason.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DlError::Fatal(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, DlError::Retry(_))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, DlError::Abort(_))
    }
}

pub type DlResult<T> = std::result::Result<T, DlError>;
