//! `Persistor`: the out-of-scope XML/HDF5 backends' contract, plus the
//! backend-agnostic persisted-record shape and two in-crate implementations
//! used by tests: [`NullPersistor`] (discards) and [`RecordingPersistor`]
//! (in-memory, for assertions).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::epoch::Epoch;
use crate::error::SymphonyResult;
use crate::iodata::{IOData, NodeConfigEntry};

/// One device's worth of persisted response data: samples, shared base
/// unit, rate, and the node-configuration trail of the *last* block
/// (representative of the pipeline the device's data traversed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedResponse {
    /// Device name.
    pub device: String,
    /// Flattened sample values, in arrival order.
    pub samples: Vec<f64>,
    /// Shared base unit of `samples`.
    pub base_unit: String,
    /// Sample rate, in Hz.
    pub sample_rate_hz: f64,
    /// Node-configuration provenance trail.
    pub node_config_trail: Vec<NodeConfigEntry>,
}

/// One device's worth of persisted stimulus metadata (parameters + known
/// duration; samples are not re-persisted, only the response side is).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStimulus {
    /// Device name.
    pub device: String,
    /// Parameters that produced this stimulus.
    pub parameters: Json,
    /// Known duration in seconds, `None` if indefinite.
    pub duration_secs: Option<f64>,
}

/// The backend-agnostic persisted-record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEpoch {
    /// Protocol identifier.
    pub protocol_id: String,
    /// Persisted protocol parameters.
    pub protocol_parameters: Json,
    /// Per-device stimulus parameters and duration.
    pub stimuli: Vec<PersistedStimulus>,
    /// Per-device response samples, units, and rate.
    pub responses: Vec<PersistedResponse>,
    /// Epoch start time.
    pub start_time: Option<DateTime<Utc>>,
    /// Keywords.
    pub keywords: Vec<String>,
    /// Free-form properties.
    pub properties: Json,
}

impl PersistedEpoch {
    /// Flatten a live `Epoch` into its backend-agnostic persisted shape.
    pub fn from_epoch(epoch: &Epoch) -> Self {
        let stimuli = epoch
            .stimuli()
            .iter()
            .map(|(device, stim)| PersistedStimulus {
                device: device.clone(),
                parameters: stim.parameters().clone(),
                duration_secs: stim.duration().map(|d| d.as_duration().as_secs_f64()),
            })
            .collect();

        let responses = epoch
            .responses()
            .iter()
            .map(|(device, response)| {
                let samples: Vec<f64> = response.blocks().iter().flat_map(IOData::samples).map(|m| m.to_f64()).collect();
                let base_unit = response
                    .blocks()
                    .iter()
                    .find_map(IOData::base_unit)
                    .unwrap_or_default()
                    .to_string();
                let node_config_trail = response
                    .blocks()
                    .iter()
                    .flat_map(|b| b.node_config_trail().to_vec())
                    .collect();
                PersistedResponse {
                    device: device.clone(),
                    samples,
                    base_unit,
                    sample_rate_hz: response.sample_rate().to_f64(),
                    node_config_trail,
                }
            })
            .collect();

        Self {
            protocol_id: epoch.protocol_id().to_string(),
            protocol_parameters: epoch.protocol_parameters().clone(),
            stimuli,
            responses,
            start_time: epoch.start_time(),
            keywords: epoch.keywords().iter().cloned().collect(),
            properties: epoch.properties().clone(),
        }
    }
}

/// Sink for finished Epochs. `serialize` is a pure sink: it
/// must complete (or raise) before control returns — no buffering across
/// calls.
pub trait Persistor: Send {
    /// Open a new `EpochGroup` for subsequent `serialize` calls.
    fn begin_epoch_group(
        &mut self,
        label: &str,
        source: &str,
        keywords: &[String],
        properties: &Json,
        id: uuid::Uuid,
        start: DateTime<Utc>,
    ) -> SymphonyResult<()>;

    /// Persist one completed Epoch. Never called for a discarded Epoch.
    fn serialize(&mut self, epoch: &Epoch) -> SymphonyResult<()>;

    /// Close the currently open `EpochGroup`.
    fn end_epoch_group(&mut self, end: DateTime<Utc>) -> SymphonyResult<()>;
}

/// Discards everything. Useful for tests that only care about `Controller`
/// lifecycle, not persisted content.
#[derive(Debug, Default)]
pub struct NullPersistor;

impl Persistor for NullPersistor {
    fn begin_epoch_group(&mut self, _label: &str, _source: &str, _keywords: &[String], _properties: &Json, _id: uuid::Uuid, _start: DateTime<Utc>) -> SymphonyResult<()> {
        Ok(())
    }

    fn serialize(&mut self, _epoch: &Epoch) -> SymphonyResult<()> {
        Ok(())
    }

    fn end_epoch_group(&mut self, _end: DateTime<Utc>) -> SymphonyResult<()> {
        Ok(())
    }
}

/// Buffers every persisted Epoch in memory, keyed by the currently open
/// group. Used by integration tests to assert what would have been written.
#[derive(Debug, Default)]
pub struct RecordingPersistor {
    groups: HashMap<uuid::Uuid, Vec<PersistedEpoch>>,
    current_group: Option<uuid::Uuid>,
}

impl RecordingPersistor {
    /// A persistor with no groups opened yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Epochs persisted under the most recently opened group.
    pub fn epochs(&self) -> &[PersistedEpoch] {
        self.current_group
            .and_then(|id| self.groups.get(&id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl Persistor for RecordingPersistor {
    fn begin_epoch_group(&mut self, _label: &str, _source: &str, _keywords: &[String], _properties: &Json, id: uuid::Uuid, _start: DateTime<Utc>) -> SymphonyResult<()> {
        self.groups.entry(id).or_default();
        self.current_group = Some(id);
        Ok(())
    }

    fn serialize(&mut self, epoch: &Epoch) -> SymphonyResult<()> {
        let id = self
            .current_group
            .ok_or_else(|| crate::error::SymphonyError::Validation("serialize called with no open EpochGroup".into()))?;
        self.groups.entry(id).or_default().push(PersistedEpoch::from_epoch(epoch));
        Ok(())
    }

    fn end_epoch_group(&mut self, _end: DateTime<Utc>) -> SymphonyResult<()> {
        self.current_group = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use crate::stimulus::{RenderedStimulus, Stimulus};
    use chrono::Utc;

    fn rendered(n: usize) -> Stimulus {
        let samples = (0..n).map(|_| Measurement::of(1.0, "V")).collect();
        let data = IOData::new(samples, Measurement::of(1000.0, "Hz")).unwrap();
        Stimulus::Rendered(RenderedStimulus::new(data, serde_json::json!({"amplitude": 1.0})))
    }

    #[test]
    fn recording_persistor_requires_an_open_group() {
        let mut persistor = RecordingPersistor::new();
        let epoch = Epoch::new("proto".into(), serde_json::json!({}));
        assert!(persistor.serialize(&epoch).is_err());
    }

    #[test]
    fn recording_persistor_collects_epochs_in_the_open_group() {
        let mut persistor = RecordingPersistor::new();
        let group_id = uuid::Uuid::new_v4();
        persistor.begin_epoch_group("grp", "src", &[], &serde_json::json!({}), group_id, Utc::now()).unwrap();

        let mut epoch = Epoch::new("proto".into(), serde_json::json!({}));
        epoch.bind_stimulus("amp", rendered(10));
        persistor.serialize(&epoch).unwrap();

        assert_eq!(persistor.epochs().len(), 1);
        assert_eq!(persistor.epochs()[0].protocol_id, "proto");
        assert_eq!(persistor.epochs()[0].stimuli[0].duration_secs, Some(0.01));
    }

    #[test]
    fn null_persistor_discards_everything() {
        let mut persistor = NullPersistor;
        let epoch = Epoch::new("proto".into(), serde_json::json!({}));
        persistor.serialize(&epoch).unwrap();
    }
}
