//! # Error types surfaced by the arbitration engine.
//!
//! A transaction driven through [`Supervisor::with_worker`](crate::Supervisor::with_worker)
//! can fail for a small, closed set of reasons, captured by [`TransactionError`].
//! Errors produced by caller-supplied code (the [`Request`](crate::Request)
//! callbacks and the work closure) are carried inside the matching variant as
//! a [`BoxError`] so they reach the caller unchanged.
//!
//! [`TransactionError::as_label`] provides short stable labels for logs and
//! metrics.

use thiserror::Error;

/// Boxed error returned by caller-supplied request callbacks and work closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// # Outcome errors for a single arbitrated transaction.
///
/// Every variant maps to one terminal disposition of a request; the engine
/// never retries and never wraps a caller error in more than one layer.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The request failed its validity check before admission.
    #[error("request invalid: {0}")]
    Invalid(#[source] BoxError),

    /// The request did not supersede the active or waiting request on its key.
    #[error("request superseded: {0}")]
    Superseded(#[source] BoxError),

    /// The caller's context was canceled while awaiting a supervisor response.
    #[error("transaction canceled")]
    Canceled,

    /// The work closure returned an error, passed through unchanged.
    #[error(transparent)]
    Work(BoxError),

    /// The finalize step failed after the work closure succeeded.
    #[error("finalize failed: {0}")]
    Finalize(#[source] BoxError),

    /// The supervisor loop has terminated; the queue no longer accepts messages.
    #[error("supervisor terminated")]
    Terminated,
}

impl TransactionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransactionError::Invalid(_) => "invalid",
            TransactionError::Superseded(_) => "superseded",
            TransactionError::Canceled => "canceled",
            TransactionError::Work(_) => "work_failed",
            TransactionError::Finalize(_) => "finalize_failed",
            TransactionError::Terminated => "terminated",
        }
    }
}
