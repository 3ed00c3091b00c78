//! Engine configuration, loaded from `symphony.toml` plus `SYMPHONY_`-prefixed
//! environment overrides.
//!
//! A base TOML file merged with environment overrides, deserialized into a
//! strongly typed struct up front so misconfiguration fails before any
//! device is opened.
//!
//! # Example
//! ```no_run
//! use symphony_core::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("symphony.toml").unwrap();
//! println!("sample rate: {} Hz", config.sample_rate_hz);
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::SymphonyResult;

/// Declared channel, discovered/validated against the hardware at
/// `beginSetup()` time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDeclaration {
    /// Stream name, unique within the controller.
    pub name: String,
    /// Channel type, e.g. "AnalogIn", "AnalogOut", "DigitalIn".
    pub channel_type: String,
    /// Device-native channel number.
    pub channel_number: u16,
    /// Physical unit the stream converts samples to/from, e.g. "V".
    pub measurement_conversion_target: String,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Canonical sample rate in Hz, shared by controller and all streams.
    pub sample_rate_hz: f64,

    /// Bridge poll cadence. Typ. 250-500 ms, scaled up at high rates.
    #[serde(with = "humantime_serde", default = "default_process_interval")]
    pub process_interval: Duration,

    /// Minimum number of `process_interval`-sized blocks that must be in
    /// flight before `start()` returns (`PRELOAD_DURATION = preload_blocks x
    /// process_interval`).
    #[serde(default = "default_preload_blocks")]
    pub preload_blocks: u32,

    /// Channels discovered/declared for this controller.
    #[serde(default)]
    pub channels: Vec<ChannelDeclaration>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration, consumed by [`crate::tracing_init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing`/`log`-style level filter, e.g. "info", "debug".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_process_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_preload_blocks() -> u32 {
    2
}

impl EngineConfig {
    /// Load configuration from `symphony.toml` in the current directory plus
    /// `SYMPHONY_`-prefixed environment overrides.
    pub fn load() -> SymphonyResult<Self> {
        Self::load_from("symphony.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SymphonyResult<Self> {
        let config: EngineConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SYMPHONY_").split("_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check fields that figment's deserialization can't express:
    /// sample rate must be positive.
    pub fn validate(&self) -> SymphonyResult<()> {
        if self.sample_rate_hz <= 0.0 {
            return Err(crate::error::SymphonyError::Validation(format!(
                "sample_rate_hz must be > 0, got {}",
                self.sample_rate_hz
            )));
        }
        if self.preload_blocks < 1 {
            return Err(crate::error::SymphonyError::Validation(
                "preload_blocks must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// `PRELOAD_DURATION = preload_blocks x process_interval`.
    pub fn preload_duration(&self) -> Duration {
        self.process_interval * self.preload_blocks
    }
}
