//! `IOData`: an immutable block of [`Measurement`] samples tagged with a
//! sample rate and a node-configuration provenance trail.
//!
//! Blocks are produced by stimuli, flow downstream node-by-node (each node
//! exclusively owns the block while transforming it), and are consumed by the
//! hardware bridge. Every transformation (`split`, `concat`, `with_units`,
//! `with_node_config`) returns a new block rather than mutating in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{SymphonyError, SymphonyResult};
use crate::measurement::registry::UnitRegistry;
use crate::measurement::Measurement;

/// A duration expressed precisely enough to round-trip through a sample
/// count at a given rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan(Duration);

impl TimeSpan {
    /// Zero duration.
    pub const ZERO: TimeSpan = TimeSpan(Duration::ZERO);

    /// Construct from a raw `Duration`.
    pub fn from_duration(d: Duration) -> Self {
        TimeSpan(d)
    }

    /// Number of whole samples at `rate_hz` within this span (floor).
    pub fn to_samples(self, rate_hz: f64) -> usize {
        (self.0.as_secs_f64() * rate_hz).floor().max(0.0) as usize
    }

    /// Exact duration covered by `count` samples at `rate_hz`.
    pub fn from_samples(count: usize, rate_hz: f64) -> Self {
        TimeSpan(Duration::from_secs_f64(count as f64 / rate_hz))
    }

    /// Underlying `Duration`.
    pub fn as_duration(self) -> Duration {
        self.0
    }
}

/// One entry in a block's provenance trail: the name of a node it passed
/// through, and a snapshot of that node's configuration at the time.
pub type NodeConfigEntry = (String, serde_json::Value);

/// An immutable, finite block of measurements at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct IOData {
    samples: Arc<Vec<Measurement>>,
    sample_rate: Measurement,
    start_time: Option<DateTime<Utc>>,
    node_config_trail: Arc<Vec<NodeConfigEntry>>,
}

impl IOData {
    /// Build a new block. Fails if samples don't share a base unit, or if
    /// `sample_rate` isn't a positive `Hz` quantity.
    pub fn new(samples: Vec<Measurement>, sample_rate: Measurement) -> SymphonyResult<Self> {
        Self::validate_rate(&sample_rate)?;
        if let Some(first) = samples.first() {
            for s in &samples[1..] {
                if s.base_unit() != first.base_unit() {
                    return Err(SymphonyError::UnitMismatch {
                        expected: first.base_unit().to_string(),
                        actual: s.base_unit().to_string(),
                    });
                }
            }
        }
        Ok(Self {
            samples: Arc::new(samples),
            sample_rate,
            start_time: None,
            node_config_trail: Arc::new(Vec::new()),
        })
    }

    /// An empty block at the given rate (no samples, no base unit yet).
    pub fn empty(sample_rate: Measurement) -> SymphonyResult<Self> {
        Self::new(Vec::new(), sample_rate)
    }

    fn validate_rate(rate: &Measurement) -> SymphonyResult<()> {
        if rate.base_unit() != "Hz" {
            return Err(SymphonyError::Validation(format!(
                "sample rate must be in Hz, got {}",
                rate.base_unit()
            )));
        }
        if rate.value() <= Decimal::ZERO {
            return Err(SymphonyError::Validation(format!(
                "sample rate must be > 0 Hz, got {}",
                rate.value()
            )));
        }
        Ok(())
    }

    /// Samples carried by this block.
    pub fn samples(&self) -> &[Measurement] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when there are no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample rate, always a positive `Hz` measurement.
    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    fn rate_hz(&self) -> f64 {
        self.sample_rate.to_f64()
    }

    /// Shared base unit of the samples, or `None` for an empty block.
    pub fn base_unit(&self) -> Option<&str> {
        self.samples.first().map(Measurement::base_unit)
    }

    /// Acquisition timestamp, set once the block has actually been read from
    /// hardware (stimulus-produced blocks carry `None` until the bridge
    /// stamps them).
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Return a copy of this block stamped with `start_time`.
    pub fn with_start_time(&self, start_time: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.start_time = Some(start_time);
        copy
    }

    /// Total duration: `len() / sample_rate`.
    pub fn duration(&self) -> TimeSpan {
        TimeSpan::from_samples(self.len(), self.rate_hz())
    }

    /// Read-only view of the provenance trail. Append-only; treat as a log,
    /// not a namespace (later entries for the same node name do not replace
    /// earlier ones).
    pub fn node_config_trail(&self) -> &[NodeConfigEntry] {
        &self.node_config_trail
    }

    /// Append a `(nodeName, configSnapshot)` entry, returning a new block.
    pub fn with_node_config(&self, node_name: impl Into<String>, config: serde_json::Value) -> Self {
        let mut trail = (*self.node_config_trail).clone();
        trail.push((node_name.into(), config));
        Self {
            samples: self.samples.clone(),
            sample_rate: self.sample_rate.clone(),
            start_time: self.start_time,
            node_config_trail: Arc::new(trail),
        }
    }

    /// Split at `duration`: `head.duration() <= duration`. If
    /// `duration >= self.duration()`, `head = self` and `rest` is empty.
    pub fn split(&self, duration: TimeSpan) -> (IOData, IOData) {
        let split_at = duration.to_samples(self.rate_hz()).min(self.len());
        let head_samples = self.samples[..split_at].to_vec();
        let rest_samples = self.samples[split_at..].to_vec();
        let head = Self {
            samples: Arc::new(head_samples),
            sample_rate: self.sample_rate.clone(),
            start_time: self.start_time,
            node_config_trail: self.node_config_trail.clone(),
        };
        let rest = Self {
            samples: Arc::new(rest_samples),
            sample_rate: self.sample_rate.clone(),
            start_time: None,
            node_config_trail: self.node_config_trail.clone(),
        };
        (head, rest)
    }

    /// Concatenate two blocks of equal rate and base unit. Concatenation
    /// with an empty block is the identity.
    pub fn concat(&self, other: &IOData) -> SymphonyResult<IOData> {
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.sample_rate != other.sample_rate {
            return Err(SymphonyError::Validation(format!(
                "cannot concat blocks of differing rate: {} vs {}",
                self.sample_rate, other.sample_rate
            )));
        }
        if self.base_unit() != other.base_unit() {
            return Err(SymphonyError::UnitMismatch {
                expected: self.base_unit().unwrap_or_default().to_string(),
                actual: other.base_unit().unwrap_or_default().to_string(),
            });
        }
        let mut samples = (*self.samples).clone();
        samples.extend(other.samples.iter().cloned());
        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: self.sample_rate.clone(),
            start_time: self.start_time,
            node_config_trail: self.node_config_trail.clone(),
        })
    }

    /// Convert every sample to `target_unit` via `registry`. Idempotent when
    /// `target_unit` already matches the block's base unit.
    pub fn with_units(&self, target_unit: &str, registry: &UnitRegistry) -> SymphonyResult<IOData> {
        if self.base_unit() == Some(target_unit) {
            return Ok(self.clone());
        }
        let converted = self
            .samples
            .iter()
            .map(|m| registry.convert(m, target_unit))
            .collect::<SymphonyResult<Vec<_>>>()?;
        Ok(Self {
            samples: Arc::new(converted),
            sample_rate: self.sample_rate.clone(),
            start_time: self.start_time,
            node_config_trail: self.node_config_trail.clone(),
        })
    }

    /// Raw driver-native integer counts, rounding each sample's value. Used
    /// when handing a block to [`crate::bridge::HardwareBridge::preload`] /
    /// `read_write`.
    pub fn to_counts(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|m| m.value().round().to_i16().unwrap_or(0))
            .collect()
    }
}

/// A fully materialised `(nodeName, config)` snapshot used for serialization,
/// kept separate from `serde_json::Value` trail entries to match the
/// backend-agnostic persisted-record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigSnapshot {
    /// Node name.
    pub node_name: String,
    /// Configuration snapshot.
    pub config: serde_json::Value,
}
