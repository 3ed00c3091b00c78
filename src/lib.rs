//! Symphony's acquisition core: a duplex, sample-accurate pipeline engine
//! for electrophysiology experiments.
//!
//! A canonical sample rate is shared by every [`stream::Stream`] bound to a
//! [`device::ExternalDevice`]; a [`bridge::DaqController`] drives the duplex
//! hardware loop at a fixed `process_interval` cadence against a vendor
//! [`bridge::HardwareBridge`]; [`controller::Controller`] orchestrates one
//! [`epoch::Epoch`] at a time end to end — validate, preload, run, stop,
//! persist — and fires lifecycle [`events::Event`]s along the way.
//!
//! Physical quantities ([`measurement::Measurement`]) carry an exact decimal
//! value and a base unit; conversions between units go through a
//! [`measurement::registry::UnitRegistry`] rather than ad hoc arithmetic.

#![cfg_attr(not(test), warn(missing_docs))]

pub mod bridge;
pub mod config;
pub mod controller;
pub mod device;
pub mod epoch;
pub mod error;
pub mod events;
pub mod iodata;
pub mod measurement;
pub mod persistor;
pub mod stimulus;
pub mod stream;
pub mod tracing_init;

pub use config::EngineConfig;
pub use controller::{CancelHandle, Controller};
pub use device::ExternalDevice;
pub use epoch::{Epoch, EpochGroup};
pub use error::{SymphonyError, SymphonyResult};
pub use events::{Event, EventBus};
pub use iodata::{IOData, TimeSpan};
pub use measurement::registry::UnitRegistry;
pub use measurement::Measurement;
pub use persistor::{NullPersistor, PersistedEpoch, Persistor, RecordingPersistor};
pub use stimulus::{Response, Stimulus};
pub use stream::{Direction, Stream};
