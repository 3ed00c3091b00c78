//! `Stream`: one data channel on a device — output (to hardware) or input
//! (from hardware) — binding a shared sample rate and optional unit
//! conversion target to a single device slot.

use crate::error::{SymphonyError, SymphonyResult};
use crate::iodata::{IOData, TimeSpan};
use crate::measurement::registry::UnitRegistry;
use crate::measurement::Measurement;

/// Direction a [`Stream`] carries data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Computer -> hardware.
    Out,
    /// Hardware -> computer.
    In,
}

/// One channel bound to a device. Streams don't hold a live reference to
/// their device or bridge -- the Controller passes a Stream's
/// device/epoch/registry explicitly at each
/// call site instead of the Stream holding `Rc`/`RefCell` pointers to them).
#[derive(Debug, Clone)]
pub struct Stream {
    name: String,
    direction: Direction,
    device_name: Option<String>,
    measurement_conversion_target: Option<String>,
    sample_rate: Measurement,
    /// Running position, in samples written/read since the Stream last
    /// started. Output-only in the narrow sense that input
    /// streams track it implicitly via accumulated Response duration, but we
    /// track it uniformly here for diagnostics.
    position: usize,
}

impl Stream {
    /// Construct a new, unbound Stream.
    pub fn new(name: impl Into<String>, direction: Direction, sample_rate: Measurement) -> SymphonyResult<Self> {
        if sample_rate.base_unit() != "Hz" {
            return Err(SymphonyError::Validation(format!(
                "stream sample rate must be in Hz, got {}",
                sample_rate.base_unit()
            )));
        }
        Ok(Self {
            name: name.into(),
            direction,
            device_name: None,
            measurement_conversion_target: None,
            sample_rate,
            position: 0,
        })
    }

    /// Stream name, unique within its device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Shared sample rate. Every Stream on the same device must agree.
    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    /// Unit this stream's data is converted to/from at the device boundary.
    pub fn measurement_conversion_target(&self) -> Option<&str> {
        self.measurement_conversion_target.as_deref()
    }

    /// Set the conversion target.
    pub fn set_measurement_conversion_target(&mut self, target: impl Into<String>) {
        self.measurement_conversion_target = Some(target.into());
    }

    /// Device this stream is bound to, if any.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Bind this stream to a device. Streams must be bound before a
    /// Controller will route data through them.
    pub fn bind_device(&mut self, device_name: impl Into<String>) {
        self.device_name = Some(device_name.into());
    }

    /// Samples written/read since the last reset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Reset the position counter, e.g. at the start of a new epoch group.
    pub fn reset_position(&mut self) {
        self.position = 0;
    }

    /// Validate this stream is ready to participate in an acquisition loop:
    /// bound to a device and (if a conversion target was requested) that the
    /// target is a non-empty unit string.
    pub fn validate(&self) -> SymphonyResult<()> {
        if self.device_name.is_none() {
            return Err(SymphonyError::Validation(format!(
                "stream '{}' is not bound to a device",
                self.name
            )));
        }
        if matches!(self.measurement_conversion_target.as_deref(), Some("")) {
            return Err(SymphonyError::Validation(format!(
                "stream '{}' has an empty conversion target",
                self.name
            )));
        }
        Ok(())
    }

    /// Apply this stream's conversion target to an outgoing (computer ->
    /// hardware) block and advance `position`. Identity if no target is set.
    pub fn finalize_output_block(&mut self, block: IOData, registry: &UnitRegistry) -> SymphonyResult<IOData> {
        let converted = match &self.measurement_conversion_target {
            Some(target) => block.with_units(target, registry)?,
            None => block,
        };
        self.position += converted.len();
        Ok(converted.with_node_config(self.name.clone(), serde_json::json!({ "direction": "out" })))
    }

    /// Apply this stream's conversion target to an incoming (hardware ->
    /// computer) block and advance `position`. Identity if no target is set.
    pub fn finalize_input_block(&mut self, block: IOData, registry: &UnitRegistry) -> SymphonyResult<IOData> {
        let converted = match &self.measurement_conversion_target {
            Some(target) => block.with_units(target, registry)?,
            None => block,
        };
        self.position += converted.len();
        Ok(converted.with_node_config(self.name.clone(), serde_json::json!({ "direction": "in" })))
    }

    /// Duration corresponding to `samples_count` samples at this stream's
    /// rate.
    pub fn duration_of(&self, samples_count: usize) -> TimeSpan {
        TimeSpan::from_samples(samples_count, self.sample_rate.to_f64())
    }
}

/// Check that every stream in `streams` shares the same sample rate,
/// naming the first mismatched stream on failure.
pub fn validate_shared_rate<'a>(streams: impl IntoIterator<Item = &'a Stream>) -> SymphonyResult<Measurement> {
    let mut iter = streams.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| SymphonyError::Validation("no streams to validate".into()))?;
    for s in iter {
        if s.sample_rate() != first.sample_rate() {
            return Err(SymphonyError::Validation(format!(
                "stream '{}' rate {} does not match stream '{}' rate {}",
                s.name(),
                s.sample_rate(),
                first.name(),
                first.sample_rate()
            )));
        }
    }
    Ok(first.sample_rate().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_stream_fails_validation() {
        let stream = Stream::new("ao0", Direction::Out, Measurement::of(10_000.0, "Hz")).unwrap();
        assert!(stream.validate().is_err());
    }

    #[test]
    fn bound_stream_with_no_conversion_target_is_valid() {
        let mut stream = Stream::new("ao0", Direction::Out, Measurement::of(10_000.0, "Hz")).unwrap();
        stream.bind_device("amp");
        assert!(stream.validate().is_ok());
    }

    #[test]
    fn finalize_advances_position() {
        let registry = UnitRegistry::new();
        let mut stream = Stream::new("ai0", Direction::In, Measurement::of(1000.0, "Hz")).unwrap();
        stream.bind_device("amp");
        let block = IOData::new(vec![Measurement::of(1.0, "V"); 100], Measurement::of(1000.0, "Hz")).unwrap();
        stream.finalize_input_block(block, &registry).unwrap();
        assert_eq!(stream.position(), 100);
    }

    #[test]
    fn mismatched_rates_are_rejected() {
        let a = Stream::new("ao0", Direction::Out, Measurement::of(1000.0, "Hz")).unwrap();
        let b = Stream::new("ao1", Direction::Out, Measurement::of(2000.0, "Hz")).unwrap();
        assert!(validate_shared_rate([&a, &b]).is_err());
    }

    #[test]
    fn rejects_non_hz_rate() {
        assert!(Stream::new("ao0", Direction::Out, Measurement::of(1.0, "V")).is_err());
    }
}
