//! # The per-request contract implemented by callers.
//!
//! A [`Request`] describes one unit of contended work: the key it competes
//! for, whether it is still worth running, how it ranks against other
//! requests on the same key, and the commit step to run once its work
//! succeeds. The engine treats the request as opaque beyond this contract.
//!
//! All four callbacks execute on the supervisor loop task and must be cheap
//! and non-blocking; a slow `finalize` stalls arbitration for every key.

use std::any::Any;

use crate::error::BoxError;

/// # One admission candidate for a contended key.
///
/// Shared with the engine as an `Arc<dyn Request>`; the same allocation
/// backs the begin and end halves of the transaction, so implementations
/// need no interior mutability for the engine's sake.
///
/// For any two distinct requests on the same key, callers must guarantee
/// that at least one direction of [`supersedes`](Request::supersedes)
/// succeeds. The engine does not repair violations: when neither direction
/// holds, the incumbent wins.
pub trait Request: Send + Sync + 'static {
    /// Returns the key identifying the resource this request contends for.
    ///
    /// Must be stable for the lifetime of the request.
    fn key(&self) -> i64;

    /// Checks that the request is still worth admitting.
    ///
    /// Called once by the supervisor before admission; an error rejects the
    /// request without running its work.
    fn valid(&self) -> Result<(), BoxError>;

    /// Returns `Ok` iff `self` should preempt `other`.
    ///
    /// An `Err` means `self` is the redundant one; the error is the
    /// diagnostic handed back to whichever caller loses.
    fn supersedes(&self, other: &dyn Request) -> Result<(), BoxError>;

    /// Commits the result of a successful work closure.
    ///
    /// Runs on the supervisor task, atomically with respect to other
    /// activations of the same key. An error converts the transaction into
    /// a finalize failure.
    fn finalize(&self) -> Result<(), BoxError>;

    /// Upcast used by `supersedes` implementations to recover their
    /// concrete type from `&dyn Request`.
    fn as_any(&self) -> &dyn Any;
}
