//! `ExternalDevice`: groups the streams belonging to one physical instrument
//! and applies device-level conversion and background policy.
//!
//! Three flavours, modeled as an enum over strategy closures rather than a
//! subclass hierarchy:
//! unit-converting (identity + `convert`), coalescing (many inputs -> one,
//! via a user-supplied function), and telegraph-aware (reads auxiliary
//! streams to decode amplifier mode/gain, then uses those params for both
//! background selection and conversion on the scaled output stream).

use std::collections::HashMap;
use std::sync::Arc;

use crate::epoch::Epoch;
use crate::error::{SymphonyError, SymphonyResult};
use crate::iodata::{IOData, TimeSpan};
use crate::measurement::registry::UnitRegistry;
use crate::measurement::Measurement;
use crate::stimulus::synthesize_background;

/// Decoded amplifier/telegraph parameters, fetched once per input tick and
/// reused for the matching output pull -- the output path uses the *same*
/// params fetched at pull time.
#[derive(Debug, Clone)]
pub struct TelegraphParams {
    /// Background value to emit while these params are in effect.
    pub background: Measurement,
    /// Unit to convert the scaled output/input stream to/from.
    pub conversion_target: String,
}

/// Signature for a coalescing device's merge function.
pub type CoalesceFn = Arc<dyn Fn(&[IOData]) -> SymphonyResult<IOData> + Send + Sync>;

/// Signature for a telegraph-aware device's decoder.
pub type ReadTelegraphFn = Arc<dyn Fn(&HashMap<String, IOData>) -> SymphonyResult<TelegraphParams> + Send + Sync>;

/// The behavioral flavour of an [`ExternalDevice`].
#[derive(Clone)]
pub enum DeviceKind {
    /// Identity except for a fixed device-level unit conversion.
    UnitConverting {
        /// Unit this device normalizes every sample to.
        target_unit: String,
    },
    /// Many inputs -> one: waits for one block on each bound input stream,
    /// then merges them.
    Coalescing {
        /// Streams that must each deliver a block before coalescing fires.
        input_streams: Vec<String>,
        /// User-supplied merge function.
        coalesce: CoalesceFn,
    },
    /// Reads N auxiliary streams to decode amplifier mode/gain/etc, and uses
    /// the decoded params to pick background/conversion for the scaled
    /// output stream.
    TelegraphAware {
        /// Auxiliary stream names carrying telegraph signals.
        aux_streams: Vec<String>,
        /// Decoder callback.
        read_telegraph: ReadTelegraphFn,
    },
}

impl std::fmt::Debug for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::UnitConverting { target_unit } => {
                f.debug_struct("UnitConverting").field("target_unit", target_unit).finish()
            }
            DeviceKind::Coalescing { input_streams, .. } => {
                f.debug_struct("Coalescing").field("input_streams", input_streams).finish()
            }
            DeviceKind::TelegraphAware { aux_streams, .. } => {
                f.debug_struct("TelegraphAware").field("aux_streams", aux_streams).finish()
            }
        }
    }
}

/// A node representing one physical instrument: amplifier, stimulator,
/// camera, etc.
#[derive(Debug, Clone)]
pub struct ExternalDevice {
    name: String,
    /// Value emitted when no Epoch is active, and restored on clean stop.
    /// The device's own background governs between-Epoch and on stop, not
    /// during an Epoch -- Epoch.background takes precedence while running.
    background: Measurement,
    kind: DeviceKind,
    coalescing_buffer: HashMap<String, IOData>,
    last_telegraph: Option<TelegraphParams>,
}

impl ExternalDevice {
    /// Construct a new device.
    pub fn new(name: impl Into<String>, background: Measurement, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            background,
            kind,
            coalescing_buffer: HashMap::new(),
            last_telegraph: None,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device-level background, used between Epochs and on clean stop.
    pub fn background(&self) -> &Measurement {
        &self.background
    }

    /// The flavour-specific behavior.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    fn apply_device_conversion(&self, block: IOData, registry: &UnitRegistry) -> SymphonyResult<IOData> {
        match &self.kind {
            DeviceKind::UnitConverting { target_unit } => block.with_units(target_unit, registry),
            DeviceKind::TelegraphAware { .. } => match &self.last_telegraph {
                Some(params) => block.with_units(&params.conversion_target, registry),
                None => Ok(block),
            },
            DeviceKind::Coalescing { .. } => Ok(block),
        }
    }

    /// Pull output data for this device during `epoch`: draws from the
    /// bound stimulus, falling back to background fill on exhaustion.
    /// `sample_rate` is the controller's canonical rate.
    pub fn pull_output_data(
        &mut self,
        duration: TimeSpan,
        sample_rate: &Measurement,
        epoch: &mut Epoch,
        registry: &UnitRegistry,
    ) -> SymphonyResult<IOData> {
        let pulled = epoch.pull_stimulus(&self.name, duration)?;
        let remaining_duration = TimeSpan::from_samples(
            duration.to_samples(sample_rate.to_f64()).saturating_sub(pulled.len()),
            sample_rate.to_f64(),
        );
        let filled = if remaining_duration.to_samples(sample_rate.to_f64()) > 0 {
            let background = self.current_background(epoch);
            let fill = synthesize_background(&background, sample_rate, remaining_duration, registry)?;
            pulled.concat(&fill)?
        } else {
            pulled
        };
        self.apply_device_conversion(filled, registry)
    }

    /// `Epoch.background` takes precedence while an Epoch is active and
    /// binds that device; otherwise the device's own background applies.
    /// Resolved explicitly here rather than left to infer from call order.
    fn current_background(&self, epoch: &Epoch) -> Measurement {
        epoch
            .background_for(&self.name)
            .cloned()
            .unwrap_or_else(|| self.background.clone())
    }

    /// Push input data arriving on `stream_name` for this device during
    /// `epoch`. Unit-converting and telegraph-aware devices forward
    /// immediately (after conversion); coalescing devices buffer until every
    /// bound input stream has delivered one block, then merge.
    pub fn push_input_data(
        &mut self,
        stream_name: &str,
        block: IOData,
        epoch: &mut Epoch,
        registry: &UnitRegistry,
    ) -> SymphonyResult<()> {
        match &self.kind {
            DeviceKind::TelegraphAware { aux_streams, read_telegraph } if aux_streams.contains(&stream_name.to_string()) => {
                self.coalescing_buffer.insert(stream_name.to_string(), block);
                if aux_streams.iter().all(|s| self.coalescing_buffer.contains_key(s)) {
                    let snapshot: HashMap<String, IOData> = aux_streams
                        .iter()
                        .map(|s| (s.clone(), self.coalescing_buffer.remove(s).expect("checked above")))
                        .collect();
                    self.last_telegraph = Some(read_telegraph(&snapshot)?);
                }
                Ok(())
            }
            DeviceKind::Coalescing { input_streams, coalesce } => {
                self.coalescing_buffer.insert(stream_name.to_string(), block);
                if input_streams.iter().all(|s| self.coalescing_buffer.contains_key(s)) {
                    let ordered: Vec<IOData> = input_streams
                        .iter()
                        .map(|s| self.coalescing_buffer.remove(s).expect("checked above"))
                        .collect();
                    let merged = coalesce(&ordered)?;
                    epoch.push_response(&self.name, merged)?;
                }
                Ok(())
            }
            _ => {
                let converted = self.apply_device_conversion(block, registry)?;
                epoch.push_response(&self.name, converted)
            }
        }
    }

    /// Validate that this device's kind references streams consistently
    /// (coalescing/telegraph input lists are non-empty).
    pub fn validate(&self) -> SymphonyResult<()> {
        match &self.kind {
            DeviceKind::Coalescing { input_streams, .. } if input_streams.is_empty() => Err(SymphonyError::Validation(
                format!("device '{}' is coalescing but declares no input streams", self.name),
            )),
            DeviceKind::TelegraphAware { aux_streams, .. } if aux_streams.is_empty() => Err(SymphonyError::Validation(
                format!("device '{}' is telegraph-aware but declares no auxiliary streams", self.name),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::measurement::Measurement;
    use crate::stimulus::{RenderedStimulus, Stimulus};

    fn rendered(n: usize, rate_hz: f64) -> Stimulus {
        let samples = (0..n).map(|_| Measurement::of(1.0, "V")).collect();
        let data = IOData::new(samples, Measurement::of(rate_hz, "Hz")).unwrap();
        Stimulus::Rendered(RenderedStimulus::new(data, serde_json::json!({})))
    }

    #[test]
    fn background_fill_tops_off_exhausted_stimulus() {
        let registry = UnitRegistry::new();
        let mut device = ExternalDevice::new(
            "amp",
            Measurement::of(-1.0, "V"),
            DeviceKind::UnitConverting { target_unit: "V".into() },
        );
        let mut epoch = Epoch::new("proto".into(), serde_json::json!({}));
        epoch.bind_stimulus("amp", rendered(50, 1000.0));
        let rate = Measurement::of(1000.0, "Hz");
        let block = device
            .pull_output_data(TimeSpan::from_samples(100, 1000.0), &rate, &mut epoch, &registry)
            .unwrap();
        assert_eq!(block.len(), 100);
        // First 50 from the stimulus, last 50 from background.
        assert_eq!(block.samples()[60], Measurement::of(-1.0, "V"));
    }

    #[test]
    fn coalescing_device_sums_two_inputs() {
        let registry = UnitRegistry::new();
        let coalesce: CoalesceFn = Arc::new(|blocks: &[IOData]| {
            let rate = blocks[0].sample_rate().clone();
            let n = blocks[0].len();
            let mut summed = Vec::with_capacity(n);
            for i in 0..n {
                let mut acc = blocks[0].samples()[i].clone();
                for b in &blocks[1..] {
                    acc = acc.checked_add(&b.samples()[i])?;
                }
                summed.push(acc);
            }
            IOData::new(summed, rate)
        });
        let mut device = ExternalDevice::new(
            "coalesced",
            Measurement::of(0.0, "V"),
            DeviceKind::Coalescing {
                input_streams: vec!["s1".into(), "s2".into()],
                coalesce,
            },
        );
        let mut epoch = Epoch::new("proto".into(), serde_json::json!({}));
        epoch.bind_response("coalesced", Measurement::of(1000.0, "Hz"));

        let b1 = IOData::new(vec![Measurement::of(1.0, "V"); 100], Measurement::of(1000.0, "Hz")).unwrap();
        let b2 = IOData::new(vec![Measurement::of(2.0, "V"); 100], Measurement::of(1000.0, "Hz")).unwrap();
        device.push_input_data("s1", b1, &mut epoch, &registry).unwrap();
        assert!(epoch.responses().get("coalesced").unwrap().blocks().is_empty());
        device.push_input_data("s2", b2, &mut epoch, &registry).unwrap();
        let response = epoch.responses().get("coalesced").unwrap();
        assert_eq!(response.blocks().len(), 1);
        assert!(response.blocks()[0].samples().iter().all(|s| *s == Measurement::of(3.0, "V")));
    }
}
