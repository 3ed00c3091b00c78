//! Crate-wide error types.
//!
//! `SymphonyError` consolidates every error kind named in the acquisition
//! pipeline design: setup-time validation failures, unit-conversion failures,
//! hardware loop faults, vendor driver errors, and the preload-empty
//! belt-and-braces case. See `runEpoch`'s error policy for how these
//! propagate: validation errors surface synchronously before any hardware is
//! touched; everything else reaches the acquisition thread's fault path,
//! which transitions the bridge to `Faulted`, discards the current Epoch,
//! and re-raises to the caller.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SymphonyResult<T> = std::result::Result<T, SymphonyError>;

#[derive(Error, Debug)]
pub enum SymphonyError {
    /// Setup-time validation failure (rate mismatch, unbound device, etc.).
    /// Recoverable by the caller re-configuring and retrying.
    #[error("validation error: {0}")]
    Validation(String),

    /// No converter registered for the requested `(from, to)` unit pair.
    #[error("no converter registered for {from} -> {to}")]
    NoConverter {
        /// Source unit.
        from: String,
        /// Target unit.
        to: String,
    },

    /// The input measurement's base unit did not match the converter's
    /// expected source unit.
    #[error("unit mismatch: expected {expected}, got {actual}")]
    UnitMismatch {
        /// Unit the converter expected.
        expected: String,
        /// Unit actually supplied.
        actual: String,
    },

    /// The driver reported an input FIFO underrun during `readWrite`.
    #[error("hardware buffer underrun on channel {channel}")]
    HardwareBufferUnderrun {
        /// Offending channel, formatted as `"{type}{number}"`.
        channel: String,
    },

    /// The driver reported an output FIFO overflow during `readWrite`.
    #[error("hardware buffer overrun on channel {channel}")]
    HardwareBufferOverrun {
        /// Offending channel, formatted as `"{type}{number}"`.
        channel: String,
    },

    /// The vendor driver returned a non-zero status.
    #[error("device error ({code}): {message}")]
    Device {
        /// Vendor-specific error code.
        code: i32,
        /// Vendor-specific error text.
        message: String,
    },

    /// An output stream yielded zero samples during preload.
    #[error("preload failed: stream '{stream}' produced no samples before start")]
    PreloadEmpty {
        /// Name of the offending stream.
        stream: String,
    },

    /// Wraps configuration-loading failures (figment/toml).
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps I/O failures from a `Persistor` sink.
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for SymphonyError {
    fn from(value: figment::Error) -> Self {
        SymphonyError::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_offending_channel() {
        let err = SymphonyError::HardwareBufferUnderrun {
            channel: "AnalogIn0".into(),
        };
        assert!(err.to_string().contains("AnalogIn0"));
    }

    #[test]
    fn no_converter_names_both_units() {
        let err = SymphonyError::NoConverter {
            from: "V".into(),
            to: "A".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains('V') && msg.contains('A'));
    }
}
