//! `Stimulus` (output producer) and `Response` (input sink) — the objects
//! that feed and drain the pipeline for one device during one `Epoch`.
//!
//! Two stimulus variants: `Rendered` (a finite, pre-materialised
//! sequence with a known duration) and `Delegated` (a generator function,
//! possibly producing an indefinite stream). Stimuli are never retried: once
//! `pull_data` has returned a block, the caller owns it and is responsible
//! for delivering it downstream — `pull_data` always advances the cursor,
//! even if the caller later drops the block.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::SymphonyResult;
use crate::iodata::{IOData, TimeSpan};
use crate::measurement::registry::UnitRegistry;
use crate::measurement::Measurement;

/// A finite, pre-materialised stimulus. `pull_data` drains it from an
/// internal cursor; once exhausted it returns empty blocks forever.
#[derive(Debug, Clone)]
pub struct RenderedStimulus {
    data: IOData,
    remaining: IOData,
    parameters: Json,
}

impl RenderedStimulus {
    /// Build a rendered stimulus from a fully materialised block.
    pub fn new(data: IOData, parameters: Json) -> Self {
        Self {
            remaining: data.clone(),
            data,
            parameters,
        }
    }

    /// Total duration of the materialised sequence.
    pub fn duration(&self) -> TimeSpan {
        self.data.duration()
    }

    /// Parameters that will be persisted alongside the Epoch.
    pub fn parameters(&self) -> &Json {
        &self.parameters
    }

    /// Pull up to `duration` worth of samples, advancing the cursor. Returns
    /// an empty block once the sequence is exhausted.
    pub fn pull_data(&mut self, duration: TimeSpan) -> IOData {
        let (head, rest) = self.remaining.split(duration);
        self.remaining = rest;
        head
    }

    /// True once every sample has been pulled.
    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Rewind the cursor to the beginning of the materialised sequence.
    pub fn reset(&mut self) {
        self.remaining = self.data.clone();
    }
}

/// Signature for a delegated stimulus's block generator:
/// `(params, requestedDuration, samplesAlreadyPulled) -> block`. The
/// returned block's sample rate must match the request and its duration
/// must be `<= requested`.
pub type GeneratorFn = Arc<dyn Fn(&Json, TimeSpan, usize) -> SymphonyResult<IOData> + Send + Sync>;

/// Signature for a delegated stimulus's duration function: `(params) ->
/// Option<TimeSpan>`. `None` means indefinite.
pub type DurationFn = Arc<dyn Fn(&Json) -> Option<TimeSpan> + Send + Sync>;

/// A lazily-generated stimulus, possibly indefinite.
#[derive(Clone)]
pub struct DelegatedStimulus {
    generate: GeneratorFn,
    duration_fn: DurationFn,
    parameters: Json,
    samples_pulled: usize,
    sample_rate_hz: f64,
}

impl std::fmt::Debug for DelegatedStimulus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedStimulus")
            .field("parameters", &self.parameters)
            .field("samples_pulled", &self.samples_pulled)
            .finish()
    }
}

impl DelegatedStimulus {
    /// Construct a delegated stimulus from its generator and duration
    /// functions.
    pub fn new(generate: GeneratorFn, duration_fn: DurationFn, parameters: Json, sample_rate_hz: f64) -> Self {
        Self {
            generate,
            duration_fn,
            parameters,
            samples_pulled: 0,
            sample_rate_hz,
        }
    }

    /// `None` when the stimulus is indefinite.
    pub fn duration(&self) -> Option<TimeSpan> {
        (self.duration_fn)(&self.parameters)
    }

    /// Parameters that will be persisted alongside the Epoch.
    pub fn parameters(&self) -> &Json {
        &self.parameters
    }

    /// Call the generator for up to `duration` worth of samples.
    pub fn pull_data(&mut self, duration: TimeSpan) -> SymphonyResult<IOData> {
        let block = (self.generate)(&self.parameters, duration, self.samples_pulled)?;
        self.samples_pulled += block.len();
        Ok(block)
    }

    /// True once the (finite) duration has been fully pulled. Always false
    /// for indefinite stimuli.
    pub fn is_exhausted(&self) -> bool {
        match self.duration() {
            Some(total) => self.samples_pulled >= total.to_samples(self.sample_rate_hz),
            None => false,
        }
    }

    /// Rewind the cursor.
    pub fn reset(&mut self) {
        self.samples_pulled = 0;
    }
}

/// A producer of output blocks for one device during one Epoch.
#[derive(Debug, Clone)]
pub enum Stimulus {
    /// Finite, pre-materialised sequence.
    Rendered(RenderedStimulus),
    /// Lazily generated, possibly indefinite sequence.
    Delegated(DelegatedStimulus),
}

impl Stimulus {
    /// Known duration, or `None` if indefinite (only possible for
    /// `Delegated`).
    pub fn duration(&self) -> Option<TimeSpan> {
        match self {
            Stimulus::Rendered(r) => Some(r.duration()),
            Stimulus::Delegated(d) => d.duration(),
        }
    }

    /// True when this stimulus has no known end.
    pub fn is_indefinite(&self) -> bool {
        self.duration().is_none()
    }

    /// Parameters that will be persisted alongside the Epoch.
    pub fn parameters(&self) -> &Json {
        match self {
            Stimulus::Rendered(r) => r.parameters(),
            Stimulus::Delegated(d) => d.parameters(),
        }
    }

    /// Pull up to `duration` worth of samples, advancing the cursor.
    pub fn pull_data(&mut self, duration: TimeSpan) -> SymphonyResult<IOData> {
        match self {
            Stimulus::Rendered(r) => Ok(r.pull_data(duration)),
            Stimulus::Delegated(d) => d.pull_data(duration),
        }
    }

    /// True once the stimulus has produced everything it ever will.
    /// Always false for an indefinite stimulus.
    pub fn is_exhausted(&self) -> bool {
        match self {
            Stimulus::Rendered(r) => r.is_exhausted(),
            Stimulus::Delegated(d) => d.is_exhausted(),
        }
    }

    /// Rewind the cursor to the start.
    pub fn reset(&mut self) {
        match self {
            Stimulus::Rendered(r) => r.reset(),
            Stimulus::Delegated(d) => d.reset(),
        }
    }
}

/// The growing, append-only collection of input blocks for one device
/// during one Epoch.
#[derive(Debug, Clone)]
pub struct Response {
    blocks: Vec<IOData>,
    sample_rate: Measurement,
}

impl Response {
    /// Start an empty response at the given sample rate.
    pub fn new(sample_rate: Measurement) -> Self {
        Self {
            blocks: Vec::new(),
            sample_rate,
        }
    }

    /// Append a block. The block's rate must match the response's rate.
    pub fn append(&mut self, block: IOData) -> SymphonyResult<()> {
        if block.sample_rate() != &self.sample_rate {
            return Err(crate::error::SymphonyError::Validation(format!(
                "response rate {} does not match incoming block rate {}",
                self.sample_rate,
                block.sample_rate()
            )));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Discard all accumulated blocks. Used only by the Controller when a
    /// cancelled (indefinite) Epoch's partial response must be dropped.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Accumulated blocks, in arrival order.
    pub fn blocks(&self) -> &[IOData] {
        &self.blocks
    }

    /// Total duration: the sum of every block's duration.
    pub fn duration(&self) -> TimeSpan {
        let total_samples: usize = self.blocks.iter().map(IOData::len).sum();
        TimeSpan::from_samples(total_samples, self.sample_rate.to_f64())
    }

    /// Sample rate shared by every block in this response.
    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }
}

/// Synthesises background-fill blocks from `(backgroundMeasurement,
/// sampleRate)` of a given duration, used by the output path whenever the
/// bound stimulus is exhausted but the Epoch is not.
pub fn synthesize_background(
    background: &Measurement,
    sample_rate: &Measurement,
    duration: TimeSpan,
    registry: &UnitRegistry,
) -> SymphonyResult<IOData> {
    let count = duration.to_samples(sample_rate.to_f64());
    let samples = (0..count)
        .map(|_| registry.intern(background.quantity(), background.base_unit().to_string(), background.exponent()))
        .collect();
    IOData::new(samples, sample_rate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_stimulus_empties_after_exhaustion() {
        let samples = (0..100).map(|i| Measurement::of(i as f64, "V")).collect();
        let data = IOData::new(samples, Measurement::of(1000.0, "Hz")).unwrap();
        let mut stim = RenderedStimulus::new(data, serde_json::json!({}));
        let block1 = stim.pull_data(TimeSpan::from_samples(60, 1000.0));
        assert_eq!(block1.len(), 60);
        assert!(!stim.is_exhausted());
        let block2 = stim.pull_data(TimeSpan::from_samples(60, 1000.0));
        assert_eq!(block2.len(), 40);
        assert!(stim.is_exhausted());
        let block3 = stim.pull_data(TimeSpan::from_samples(60, 1000.0));
        assert!(block3.is_empty());
    }

    #[test]
    fn reset_rewinds_rendered_cursor() {
        let samples = (0..10).map(|i| Measurement::of(i as f64, "V")).collect();
        let data = IOData::new(samples, Measurement::of(1000.0, "Hz")).unwrap();
        let mut stim = RenderedStimulus::new(data, serde_json::json!({}));
        stim.pull_data(TimeSpan::from_samples(10, 1000.0));
        assert!(stim.is_exhausted());
        stim.reset();
        assert!(!stim.is_exhausted());
    }

    #[test]
    fn delegated_stimulus_reports_indefinite_duration() {
        let generate: GeneratorFn = Arc::new(|_params, duration, _cursor| {
            let count = duration.to_samples(1000.0);
            let samples = (0..count).map(|_| Measurement::of(0.0, "V")).collect();
            IOData::new(samples, Measurement::of(1000.0, "Hz"))
        });
        let duration_fn: DurationFn = Arc::new(|_params| None);
        let mut stim = DelegatedStimulus::new(generate, duration_fn, serde_json::json!({}), 1000.0);
        assert!(stim.duration().is_none());
        let block = stim.pull_data(TimeSpan::from_samples(250, 1000.0)).unwrap();
        assert_eq!(block.len(), 250);
        assert!(!stim.is_exhausted());
    }

    #[test]
    fn response_append_rejects_rate_mismatch() {
        let mut response = Response::new(Measurement::of(1000.0, "Hz"));
        let block = IOData::new(vec![Measurement::of(1.0, "V")], Measurement::of(2000.0, "Hz")).unwrap();
        assert!(response.append(block).is_err());
    }

    #[test]
    fn response_duration_sums_blocks() {
        let mut response = Response::new(Measurement::of(1000.0, "Hz"));
        let b1 = IOData::new(vec![Measurement::of(0.0, "V"); 100], Measurement::of(1000.0, "Hz")).unwrap();
        let b2 = IOData::new(vec![Measurement::of(0.0, "V"); 150], Measurement::of(1000.0, "Hz")).unwrap();
        response.append(b1).unwrap();
        response.append(b2).unwrap();
        assert_eq!(response.duration(), TimeSpan::from_samples(250, 1000.0));
    }

    #[test]
    fn background_fill_produces_exact_sample_count() {
        let registry = UnitRegistry::new();
        let bg = Measurement::of(-3.2, "V");
        let rate = Measurement::of(1000.0, "Hz");
        let block = synthesize_background(&bg, &rate, TimeSpan::from_samples(500, 1000.0), &registry).unwrap();
        assert_eq!(block.len(), 500);
        assert!(block.samples().iter().all(|s| *s == bg));
    }
}
