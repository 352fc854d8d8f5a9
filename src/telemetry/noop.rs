//! No-op implementation of the [`Instrument`] contract.

use super::{Instrument, MessageLabels, OutcomeLabels};

/// Discards every observation; the default when no instrument is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopInstrument;

impl Instrument for NopInstrument {
    fn queue_chan_depth(&self, _value: i64) {}
    fn inc_queue_chan_depth(&self) {}
    fn dec_queue_chan_depth(&self) {}

    fn processing_map_depth(&self, _value: i64) {}
    fn inc_processing_map_depth(&self) {}
    fn dec_processing_map_depth(&self) {}

    fn waiting_map_depth(&self, _value: i64) {}
    fn inc_waiting_map_depth(&self) {}
    fn dec_waiting_map_depth(&self) {}

    fn messages(&self, _latency_secs: f64, _labels: MessageLabels) {}
    fn worktime(&self, _secs: f64, _labels: OutcomeLabels) {}
    fn transactions(&self, _secs: f64, _labels: OutcomeLabels) {}
}
