//! # keyvisor
//!
//! **Keyvisor** is a per-key request arbitration engine.
//!
//! It serializes mutating work on a per-key basis while letting requests on
//! distinct keys run fully in parallel, and it rejects stale or superseded
//! requests before their side effects run. The crate is a building block
//! sitting between an ingress layer (an RPC handler fielding thousands of
//! concurrent requests) and a backing store or side-effect-producing worker
//! function.
//!
//! ## Guarantees
//!
//! | Area | Description | Key types / traits |
//! |------|-------------|--------------------|
//! | **Exclusion**   | At most one request is active per key at any time.                 | [`Supervisor`]            |
//! | **Superseding** | A newer request displaces the single waiting slot on its key; stale requests are answered with a diagnostic and never run. | [`Request::supersedes`] |
//! | **Finalize**    | The commit step runs atomically with respect to other activations of the same key. | [`Request::finalize`] |
//! | **Balance**     | Every transaction is exactly one begin and one end message, however it exits (cancellation included). | [`Supervisor::with_worker`] |
//! | **Observability** | Pluggable metrics and structured logging, no-op by default.      | [`telemetry::Instrument`], [`logging::Log`] |
//!
//! ## Example
//!
//! ```no_run
//! use std::any::Any;
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use keyvisor::{BoxError, Request, Supervisor};
//!
//! struct Put {
//!     key: i64,
//!     version: i64,
//! }
//!
//! impl Request for Put {
//!     fn key(&self) -> i64 {
//!         self.key
//!     }
//!
//!     fn valid(&self) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//!
//!     fn supersedes(&self, other: &dyn Request) -> Result<(), BoxError> {
//!         let other = other
//!             .as_any()
//!             .downcast_ref::<Put>()
//!             .ok_or("other request is not a Put")?;
//!         if self.version > other.version {
//!             Ok(())
//!         } else {
//!             Err(format!("version {} superseded by {}", self.version, other.version).into())
//!         }
//!     }
//!
//!     fn finalize(&self) -> Result<(), BoxError> {
//!         // commit the accepted version here
//!         Ok(())
//!     }
//!
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), BoxError> {
//!     let supervisor = Arc::new(Supervisor::builder().build());
//!
//!     // The arbitration loop runs on its own task.
//!     let loop_task = tokio::spawn({
//!         let supervisor = Arc::clone(&supervisor);
//!         async move { supervisor.process().await }
//!     });
//!
//!     let put = Arc::new(Put { key: 7, version: 1 });
//!     supervisor
//!         .with_worker(CancellationToken::new(), put, |_ctx| async move {
//!             // mutate the resource guarded by key 7
//!             Ok(())
//!         })
//!         .await?;
//!
//!     supervisor.terminate();
//!     loop_task.await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod error;
mod message;
mod message_map;
mod request;
mod supervisor;
mod worker;

pub mod logging;
pub mod telemetry;

// ---- Public re-exports ----

pub use error::{BoxError, TransactionError};
pub use request::Request;
pub use supervisor::{PollHook, Supervisor, SupervisorBuilder};
