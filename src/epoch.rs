//! `Epoch`: one trial — a contiguous region of the experimental timeline
//! with a defined stimulus set and optional response set — and
//! `EpochGroup`, the tree-structured collection that owns a sequence of
//! Epochs persisted together.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::error::{SymphonyError, SymphonyResult};
use crate::iodata::{IOData, TimeSpan};
use crate::measurement::Measurement;
use crate::stimulus::{Response, Stimulus};

/// One trial: stimuli to deliver, responses to collect, and the background
/// fill to use per device while this Epoch is active.
#[derive(Debug, Clone)]
pub struct Epoch {
    protocol_id: String,
    protocol_parameters: Json,
    stimuli: HashMap<String, Stimulus>,
    responses: HashMap<String, Response>,
    /// Epoch-level background override, keyed by device name. Takes
    /// precedence over the device's own background *while this Epoch is
    /// active*. Epoch.background applies during the Epoch, Device.background
    /// applies between Epochs and on clean stop).
    background: HashMap<String, (Measurement, Measurement)>,
    start_time: Option<DateTime<Utc>>,
    keywords: HashSet<String>,
    properties: Json,
}

impl Epoch {
    /// Start building a new Epoch. `protocol_parameters` are persisted
    /// verbatim alongside the record.
    pub fn new(protocol_id: String, protocol_parameters: Json) -> Self {
        Self {
            protocol_id,
            protocol_parameters,
            stimuli: HashMap::new(),
            responses: HashMap::new(),
            background: HashMap::new(),
            start_time: None,
            keywords: HashSet::new(),
            properties: Json::Object(Default::default()),
        }
    }

    /// Protocol identifier.
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Persisted protocol parameters.
    pub fn protocol_parameters(&self) -> &Json {
        &self.protocol_parameters
    }

    /// Bind a stimulus to a device for this Epoch.
    pub fn bind_stimulus(&mut self, device: impl Into<String>, stimulus: Stimulus) {
        self.stimuli.insert(device.into(), stimulus);
    }

    /// Bind an (initially empty) response sink to a device for this Epoch.
    pub fn bind_response(&mut self, device: impl Into<String>, sample_rate: Measurement) {
        self.responses.insert(device.into(), Response::new(sample_rate));
    }

    /// Set the Epoch-level background override for a device.
    pub fn bind_background(&mut self, device: impl Into<String>, value: Measurement, sample_rate: Measurement) {
        self.background.insert(device.into(), (value, sample_rate));
    }

    /// Stimuli bound to this Epoch, by device name.
    pub fn stimuli(&self) -> &HashMap<String, Stimulus> {
        &self.stimuli
    }

    /// Responses bound to this Epoch, by device name.
    pub fn responses(&self) -> &HashMap<String, Response> {
        &self.responses
    }

    /// Keywords, freely settable by the caller before `runEpoch`.
    pub fn keywords_mut(&mut self) -> &mut HashSet<String> {
        &mut self.keywords
    }

    /// Keywords.
    pub fn keywords(&self) -> &HashSet<String> {
        &self.keywords
    }

    /// Free-form properties, persisted alongside the record.
    pub fn properties(&self) -> &Json {
        &self.properties
    }

    /// Set free-form properties.
    pub fn set_properties(&mut self, properties: Json) {
        self.properties = properties;
    }

    /// Set when the caller's `runEpoch` transitions the bridge to Running.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Stamp the start time. Only the Controller should call this.
    pub fn set_start_time(&mut self, when: DateTime<Utc>) {
        self.start_time = Some(when);
    }

    /// `true` when any bound stimulus is indefinite.
    pub fn is_indefinite(&self) -> bool {
        self.stimuli.values().any(Stimulus::is_indefinite)
    }

    /// `max` over bound stimulus durations; `None` (infinite) if any
    /// stimulus is indefinite; `Some(TimeSpan::ZERO)` if there are none.
    pub fn duration(&self) -> Option<TimeSpan> {
        if self.stimuli.is_empty() {
            return Some(TimeSpan::ZERO);
        }
        self.stimuli.values().try_fold(TimeSpan::ZERO, |acc, s| Some(acc.max(s.duration()?)))
    }

    /// `true` once every bound (finite) stimulus is exhausted and every
    /// bound response has accumulated at least `duration()` worth of
    /// samples. Always `false` for an indefinite Epoch (the caller must
    /// cancel it explicitly).
    pub fn is_complete(&self) -> bool {
        if self.is_indefinite() {
            return false;
        }
        let all_stimuli_exhausted = self.stimuli.values().all(Stimulus::is_exhausted);
        let target = self.duration().unwrap_or(TimeSpan::ZERO);
        let all_responses_filled = self.responses.values().all(|r| r.duration() >= target);
        all_stimuli_exhausted && all_responses_filled
    }

    /// Validate invariants that don't depend on controller/stream state:
    /// an indefinite Epoch must bind no responses.
    pub fn validate(&self) -> SymphonyResult<()> {
        if self.is_indefinite() && !self.responses.is_empty() {
            return Err(SymphonyError::Validation(
                "indefinite Epoch must not bind any responses".into(),
            ));
        }
        Ok(())
    }

    /// Pull up to `duration` worth of samples from the stimulus bound to
    /// `device`. Devices with no bound stimulus (pure recording devices)
    /// yield an empty block rather than an error.
    pub fn pull_stimulus(&mut self, device: &str, duration: TimeSpan) -> SymphonyResult<IOData> {
        match self.stimuli.get_mut(device) {
            Some(stim) => stim.pull_data(duration),
            // No bound stimulus (pure recording device): an empty block at
            // an arbitrary placeholder rate. Callers only use `.len()` and
            // `.concat()` on it, both rate-independent for an empty block.
            None => IOData::empty(Measurement::of(1.0, "Hz")),
        }
    }

    /// Background override for `device`, if this Epoch set one.
    pub fn background_for(&self, device: &str) -> Option<&Measurement> {
        self.background.get(device).map(|(value, _rate)| value)
    }

    /// Append `block` to the response bound to `device`. Errors if no
    /// response was bound (e.g. the device wasn't declared in this Epoch).
    pub fn push_response(&mut self, device: &str, block: IOData) -> SymphonyResult<()> {
        match self.responses.get_mut(device) {
            Some(response) => response.append(block),
            None => Err(SymphonyError::Validation(format!(
                "epoch has no response bound for device '{device}'"
            ))),
        }
    }

    /// Discard all accumulated response data for every device. Used only
    /// when the Controller discards a cancelled Epoch.
    pub fn discard_responses(&mut self) {
        for response in self.responses.values_mut() {
            response.clear();
        }
    }

    /// Reset every bound stimulus's cursor to the start. Used before
    /// re-running an Epoch that was prepared but not yet started.
    pub fn reset_stimuli(&mut self) {
        for stim in self.stimuli.values_mut() {
            stim.reset();
        }
    }
}

/// A labelled collection of Epochs persisted together, forming a tree by
/// `parent`.
#[derive(Debug, Clone)]
pub struct EpochGroup {
    /// Human-readable label.
    pub label: String,
    /// Biological source identifier.
    pub source: String,
    /// Group start time.
    pub start_time: DateTime<Utc>,
    /// Group end time, set when the group is closed.
    pub end_time: Option<DateTime<Utc>>,
    /// Parent group id, if this group is nested.
    pub parent: Option<uuid::Uuid>,
    /// This group's id.
    pub id: uuid::Uuid,
    /// Keywords.
    pub keywords: HashSet<String>,
    /// Free-form properties.
    pub properties: Json,
}

impl EpochGroup {
    /// Start a new, open-ended EpochGroup.
    pub fn new(
        label: impl Into<String>,
        source: impl Into<String>,
        start_time: DateTime<Utc>,
        parent: Option<uuid::Uuid>,
    ) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
            start_time,
            end_time: None,
            parent,
            id: uuid::Uuid::new_v4(),
            keywords: HashSet::new(),
            properties: Json::Object(Default::default()),
        }
    }

    /// Close the group.
    pub fn close(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::RenderedStimulus;

    fn rendered(n: usize) -> Stimulus {
        let samples = (0..n).map(|_| Measurement::of(1.0, "V")).collect();
        let data = IOData::new(samples, Measurement::of(1000.0, "Hz")).unwrap();
        Stimulus::Rendered(RenderedStimulus::new(data, serde_json::json!({})))
    }

    #[test]
    fn indefinite_epoch_with_responses_fails_validation() {
        let generate = std::sync::Arc::new(|_: &Json, d: TimeSpan, _: usize| {
            IOData::new(vec![Measurement::of(0.0, "V"); d.to_samples(1000.0)], Measurement::of(1000.0, "Hz"))
        });
        let duration_fn = std::sync::Arc::new(|_: &Json| None);
        let mut epoch = Epoch::new("proto".into(), serde_json::json!({}));
        epoch.bind_stimulus(
            "amp",
            Stimulus::Delegated(crate::stimulus::DelegatedStimulus::new(generate, duration_fn, serde_json::json!({}), 1000.0)),
        );
        epoch.bind_response("amp", Measurement::of(1000.0, "Hz"));
        assert!(epoch.is_indefinite());
        assert!(epoch.validate().is_err());
    }

    #[test]
    fn duration_is_max_over_stimuli() {
        let mut epoch = Epoch::new("proto".into(), serde_json::json!({}));
        epoch.bind_stimulus("a", rendered(100));
        epoch.bind_stimulus("b", rendered(250));
        assert_eq!(epoch.duration(), Some(TimeSpan::from_samples(250, 1000.0)));
    }

    #[test]
    fn no_stimuli_means_zero_duration() {
        let epoch = Epoch::new("proto".into(), serde_json::json!({}));
        assert_eq!(epoch.duration(), Some(TimeSpan::ZERO));
    }
}
