//! # Metrics contract and reference instrument implementations.
//!
//! The engine reports three point-in-time gauges and three latency
//! histograms through the [`Instrument`] trait:
//!
//! | Metric | Kind | Meaning |
//! |---|---|---|
//! | [`MetricGauge::QueueChanDepth`] | gauge | unprocessed messages in the supervisor queue |
//! | [`MetricGauge::ProcessingMapDepth`] | gauge | requests currently active |
//! | [`MetricGauge::WaitingMapDepth`] | gauge | requests parked behind an active one |
//! | [`MetricHistogram::Messages`] | histogram | send-to-dispatch latency per protocol message |
//! | [`MetricHistogram::Worktime`] | histogram | duration of the caller's work closure |
//! | [`MetricHistogram::Transactions`] | histogram | full transaction duration including arbitration overhead |
//!
//! All latencies are seconds as `f64`. Three implementations ship with the
//! crate: [`NopInstrument`] (default), [`LocalInstrument`] (in-memory,
//! snapshot-able, used by the test suite), and [`PromInstrument`]
//! (prometheus registry adapter).

mod local;
mod noop;
mod prom;

pub use local::{LocalInstrument, MetricSnap, BUCKETS, OVERFLOW_BUCKET};
pub use noop::NopInstrument;
pub use prom::PromInstrument;

/// Gauge metrics maintained by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGauge {
    /// Number of messages in the queue channel.
    QueueChanDepth,
    /// Number of active processing messages.
    ProcessingMapDepth,
    /// Number of waiting messages.
    WaitingMapDepth,
}

impl MetricGauge {
    /// All gauges, in registration order.
    pub const ALL: [MetricGauge; 3] = [
        MetricGauge::QueueChanDepth,
        MetricGauge::ProcessingMapDepth,
        MetricGauge::WaitingMapDepth,
    ];

    /// Metric name (snake_case, stable).
    pub fn as_name(&self) -> &'static str {
        match self {
            MetricGauge::QueueChanDepth => "queue_chan_depth",
            MetricGauge::ProcessingMapDepth => "processing_map_depth",
            MetricGauge::WaitingMapDepth => "waiting_map_depth",
        }
    }

    /// Human-readable help string.
    pub fn help(&self) -> &'static str {
        match self {
            MetricGauge::QueueChanDepth => "Number of messages in queue channel",
            MetricGauge::ProcessingMapDepth => "Number of active processing messages",
            MetricGauge::WaitingMapDepth => "Number of waiting messages",
        }
    }
}

/// Histogram metrics maintained by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricHistogram {
    /// Time before the supervisor dispatches a message sent by a worker.
    Messages,
    /// Time to complete the arbitrated work closure.
    Worktime,
    /// Total time between the begin of a transaction and its completion.
    Transactions,
}

impl MetricHistogram {
    /// All histograms, in registration order.
    pub const ALL: [MetricHistogram; 3] = [
        MetricHistogram::Messages,
        MetricHistogram::Worktime,
        MetricHistogram::Transactions,
    ];

    /// Metric name (snake_case, stable).
    pub fn as_name(&self) -> &'static str {
        match self {
            MetricHistogram::Messages => "messages",
            MetricHistogram::Worktime => "worktime",
            MetricHistogram::Transactions => "transactions",
        }
    }

    /// Human-readable help string.
    pub fn help(&self) -> &'static str {
        match self {
            MetricHistogram::Messages => {
                "Time before supervisor processes messages sent from worker"
            }
            MetricHistogram::Worktime => "Time it takes to complete the arbitrated work closure",
            MetricHistogram::Transactions => {
                "Total time between begin of transaction and completion"
            }
        }
    }

    /// Label keys attached to observations of this histogram.
    pub fn label_keys(&self) -> &'static [&'static str] {
        match self {
            MetricHistogram::Messages => &["state", "signal", "waitlisted", "finalizefailed"],
            MetricHistogram::Worktime | MetricHistogram::Transactions => &["signal"],
        }
    }
}

/// Labels attached to [`MetricHistogram::Messages`] observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLabels {
    /// Protocol phase: `begin` or `end`.
    pub state: &'static str,
    /// Terminal disposition: `proceed`, `success`, `cease`, or `failure`.
    pub signal: &'static str,
    /// Whether the message spent time on the waitlist.
    pub waitlisted: bool,
    /// Whether finalize failed for this message.
    pub finalize_failed: bool,
}

/// Labels attached to [`MetricHistogram::Worktime`] and
/// [`MetricHistogram::Transactions`] observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeLabels {
    /// `success` or `failure`.
    pub signal: &'static str,
}

/// # Sink for engine telemetry.
///
/// Implementations must be cheap: gauges are touched on every message and
/// histogram observations happen on the supervisor loop task.
pub trait Instrument: Send + Sync {
    fn queue_chan_depth(&self, value: i64);
    fn inc_queue_chan_depth(&self);
    fn dec_queue_chan_depth(&self);

    fn processing_map_depth(&self, value: i64);
    fn inc_processing_map_depth(&self);
    fn dec_processing_map_depth(&self);

    fn waiting_map_depth(&self, value: i64);
    fn inc_waiting_map_depth(&self);
    fn dec_waiting_map_depth(&self);

    /// Observes the dispatch latency of one protocol message.
    fn messages(&self, latency_secs: f64, labels: MessageLabels);
    /// Observes the duration of one work closure.
    fn worktime(&self, secs: f64, labels: OutcomeLabels);
    /// Observes the duration of one complete transaction.
    fn transactions(&self, secs: f64, labels: OutcomeLabels);
}
