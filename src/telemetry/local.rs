//! In-memory implementation of the [`Instrument`] contract.
//!
//! Stores gauges as plain counters and histograms as fixed-bucket counts,
//! all behind one mutex. Intended for tests and for processes that want to
//! log a [`MetricSnap`] periodically instead of exporting metrics.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Instrument, MessageLabels, MetricGauge, MetricHistogram, OutcomeLabels};

/// Histogram bucket upper bounds in seconds: exponential from 20µs, factor 2.
pub const BUCKETS: [f64; 19] = [
    0.00002, 0.00004, 0.00008, 0.00016, 0.00032, 0.00064, 0.00128, 0.00256, 0.00512, 0.01024,
    0.02048, 0.04096, 0.08192, 0.16384, 0.32768, 0.65536, 1.31072, 2.62144, 5.24288,
];

/// Bucket index holding observations larger than every bound in [`BUCKETS`].
pub const OVERFLOW_BUCKET: usize = BUCKETS.len();

#[derive(Debug, Default)]
struct Inner {
    gauges: HashMap<MetricGauge, i64>,
    histograms: HashMap<MetricHistogram, HashMap<usize, i64>>,
}

/// In-memory instrument with snapshot support.
///
/// Labels are accepted but not stored; observations of one histogram are
/// aggregated regardless of label values.
#[derive(Debug, Default)]
pub struct LocalInstrument {
    inner: Mutex<Inner>,
}

impl LocalInstrument {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        for gauge in MetricGauge::ALL {
            inner.gauges.insert(gauge, 0);
        }
        for histogram in MetricHistogram::ALL {
            inner.histograms.insert(histogram, HashMap::new());
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Copies all metrics into a [`MetricSnap`].
    pub fn snap(&self) -> MetricSnap {
        let inner = self.lock();
        MetricSnap {
            gauges: inner.gauges.clone(),
            histograms: inner
                .histograms
                .iter()
                .filter(|(_, buckets)| !buckets.is_empty())
                .map(|(metric, buckets)| (*metric, buckets.clone()))
                .collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_gauge(&self, gauge: MetricGauge, value: i64) {
        self.lock().gauges.insert(gauge, value);
    }

    fn inc_gauge(&self, gauge: MetricGauge) {
        *self.lock().gauges.entry(gauge).or_insert(0) += 1;
    }

    fn dec_gauge(&self, gauge: MetricGauge) {
        *self.lock().gauges.entry(gauge).or_insert(0) -= 1;
    }

    fn observe(&self, histogram: MetricHistogram, value: f64) {
        let bucket = BUCKETS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(OVERFLOW_BUCKET);
        let mut inner = self.lock();
        *inner
            .histograms
            .entry(histogram)
            .or_default()
            .entry(bucket)
            .or_insert(0) += 1;
    }
}

impl Instrument for LocalInstrument {
    fn queue_chan_depth(&self, value: i64) {
        self.set_gauge(MetricGauge::QueueChanDepth, value);
    }

    fn inc_queue_chan_depth(&self) {
        self.inc_gauge(MetricGauge::QueueChanDepth);
    }

    fn dec_queue_chan_depth(&self) {
        self.dec_gauge(MetricGauge::QueueChanDepth);
    }

    fn processing_map_depth(&self, value: i64) {
        self.set_gauge(MetricGauge::ProcessingMapDepth, value);
    }

    fn inc_processing_map_depth(&self) {
        self.inc_gauge(MetricGauge::ProcessingMapDepth);
    }

    fn dec_processing_map_depth(&self) {
        self.dec_gauge(MetricGauge::ProcessingMapDepth);
    }

    fn waiting_map_depth(&self, value: i64) {
        self.set_gauge(MetricGauge::WaitingMapDepth, value);
    }

    fn inc_waiting_map_depth(&self) {
        self.inc_gauge(MetricGauge::WaitingMapDepth);
    }

    fn dec_waiting_map_depth(&self) {
        self.dec_gauge(MetricGauge::WaitingMapDepth);
    }

    fn messages(&self, latency_secs: f64, _labels: MessageLabels) {
        self.observe(MetricHistogram::Messages, latency_secs);
    }

    fn worktime(&self, secs: f64, _labels: OutcomeLabels) {
        self.observe(MetricHistogram::Worktime, secs);
    }

    fn transactions(&self, secs: f64, _labels: OutcomeLabels) {
        self.observe(MetricHistogram::Transactions, secs);
    }
}

/// Point-in-time copy of a [`LocalInstrument`]'s contents.
///
/// Histograms are keyed by bucket index into [`BUCKETS`]
/// ([`OVERFLOW_BUCKET`] collects everything beyond the last bound); only
/// histograms with at least one observation appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnap {
    pub gauges: HashMap<MetricGauge, i64>,
    pub histograms: HashMap<MetricHistogram, HashMap<usize, i64>>,
}

impl MetricSnap {
    /// Returns the value of one gauge (0 when absent).
    pub fn gauge(&self, gauge: MetricGauge) -> i64 {
        self.gauges.get(&gauge).copied().unwrap_or(0)
    }

    /// Rolls each histogram up to its total observation count.
    pub fn histogram_totals(&self) -> HashMap<MetricHistogram, i64> {
        self.histograms
            .iter()
            .map(|(metric, buckets)| (*metric, buckets.values().sum()))
            .collect()
    }
}
