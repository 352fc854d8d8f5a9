//! [`tracing`]-backed implementation of the [`Log`] contract.

use super::{Field, FieldsFmt, Log};

/// Forwards engine logs to the [`tracing`] ecosystem under the `keyvisor`
/// target.
///
/// Fields are rendered into the event message as ` key=value` pairs; install
/// any `tracing` subscriber (e.g. `tracing_subscriber::fmt`) to collect them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl Log for TracingLog {
    fn debug(&self, msg: &str, fields: &[Field]) {
        tracing::debug!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
    }

    fn info(&self, msg: &str, fields: &[Field]) {
        tracing::info!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
    }

    fn warn(&self, msg: &str, fields: &[Field]) {
        tracing::warn!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
    }

    fn error(&self, msg: &str, fields: &[Field]) {
        tracing::error!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
    }

    fn panic(&self, msg: &str, fields: &[Field]) {
        tracing::error!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
        panic!("{msg}");
    }

    fn dpanic(&self, msg: &str, fields: &[Field]) {
        tracing::error!(target: "keyvisor", "{msg}{}", FieldsFmt(fields));
        if cfg!(debug_assertions) {
            panic!("{msg}");
        }
    }
}
