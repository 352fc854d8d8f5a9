//! Prometheus adapter for the [`Instrument`] contract.

use std::collections::HashMap;

use prometheus::{exponential_buckets, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};

use super::{Instrument, MessageLabels, MetricGauge, MetricHistogram, OutcomeLabels};

const SUBSYSTEM: &str = "keyvisor";

/// Exposes the engine's gauges and histograms on a [`prometheus::Registry`].
///
/// Histogram buckets are exponential from 20µs with factor 2 (20 buckets),
/// matching the latency range of an in-process arbitration round trip.
pub struct PromInstrument {
    registry: Registry,
    gauges: HashMap<MetricGauge, IntGauge>,
    histograms: HashMap<MetricHistogram, HistogramVec>,
}

impl PromInstrument {
    /// Creates an instrument backed by a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Creates an instrument registering its metrics on `registry`.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let mut gauges = HashMap::new();
        for gauge in MetricGauge::ALL {
            let metric =
                IntGauge::with_opts(Opts::new(gauge.as_name(), gauge.help()).subsystem(SUBSYSTEM))?;
            registry.register(Box::new(metric.clone()))?;
            gauges.insert(gauge, metric);
        }

        let buckets = exponential_buckets(0.00002, 2.0, 20)?;
        let mut histograms = HashMap::new();
        for histogram in MetricHistogram::ALL {
            let metric = HistogramVec::new(
                HistogramOpts::new(histogram.as_name(), histogram.help())
                    .subsystem(SUBSYSTEM)
                    .buckets(buckets.clone()),
                histogram.label_keys(),
            )?;
            registry.register(Box::new(metric.clone()))?;
            histograms.insert(histogram, metric);
        }

        Ok(Self {
            registry,
            gauges,
            histograms,
        })
    }

    /// The registry the metrics are registered on, for exposition.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn gauge(&self, gauge: MetricGauge) -> Option<&IntGauge> {
        self.gauges.get(&gauge)
    }

    fn histogram(&self, histogram: MetricHistogram) -> Option<&HistogramVec> {
        self.histograms.get(&histogram)
    }
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl Instrument for PromInstrument {
    fn queue_chan_depth(&self, value: i64) {
        if let Some(g) = self.gauge(MetricGauge::QueueChanDepth) {
            g.set(value);
        }
    }

    fn inc_queue_chan_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::QueueChanDepth) {
            g.inc();
        }
    }

    fn dec_queue_chan_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::QueueChanDepth) {
            g.dec();
        }
    }

    fn processing_map_depth(&self, value: i64) {
        if let Some(g) = self.gauge(MetricGauge::ProcessingMapDepth) {
            g.set(value);
        }
    }

    fn inc_processing_map_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::ProcessingMapDepth) {
            g.inc();
        }
    }

    fn dec_processing_map_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::ProcessingMapDepth) {
            g.dec();
        }
    }

    fn waiting_map_depth(&self, value: i64) {
        if let Some(g) = self.gauge(MetricGauge::WaitingMapDepth) {
            g.set(value);
        }
    }

    fn inc_waiting_map_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::WaitingMapDepth) {
            g.inc();
        }
    }

    fn dec_waiting_map_depth(&self) {
        if let Some(g) = self.gauge(MetricGauge::WaitingMapDepth) {
            g.dec();
        }
    }

    fn messages(&self, latency_secs: f64, labels: MessageLabels) {
        if let Some(h) = self.histogram(MetricHistogram::Messages) {
            h.with_label_values(&[
                labels.state,
                labels.signal,
                bool_label(labels.waitlisted),
                bool_label(labels.finalize_failed),
            ])
            .observe(latency_secs);
        }
    }

    fn worktime(&self, secs: f64, labels: OutcomeLabels) {
        if let Some(h) = self.histogram(MetricHistogram::Worktime) {
            h.with_label_values(&[labels.signal]).observe(secs);
        }
    }

    fn transactions(&self, secs: f64, labels: OutcomeLabels) {
        if let Some(h) = self.histogram(MetricHistogram::Transactions) {
            h.with_label_values(&[labels.signal]).observe(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_metrics() {
        let pi = PromInstrument::new().expect("build instrument");

        pi.queue_chan_depth(0);
        pi.inc_processing_map_depth();
        pi.messages(
            0.001,
            MessageLabels {
                state: "begin",
                signal: "proceed",
                waitlisted: false,
                finalize_failed: false,
            },
        );
        pi.transactions(0.002, OutcomeLabels { signal: "success" });

        let families = pi.registry().gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"keyvisor_queue_chan_depth".to_string()));
        assert!(names.contains(&"keyvisor_processing_map_depth".to_string()));
        assert!(names.contains(&"keyvisor_messages".to_string()));
        assert!(names.contains(&"keyvisor_transactions".to_string()));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        PromInstrument::with_registry(registry.clone()).expect("first registration");
        assert!(PromInstrument::with_registry(registry).is_err());
    }
}
