//! Error types for dataflow driver operations

use crate::shapes::Shape;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while driving a dataflow accelerator
///
/// All variants are fatal: the driver never retries a hardware interaction,
/// because a second launch after a failed wait can corrupt in-flight buffers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Build/deployment mismatch (unrecognized platform, weight-count mismatch)
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// Caller bug (overlapping launch, oversized batch, wrong input arity)
    #[error("Precondition violated: {reason}")]
    Precondition {
        /// Reason for failure
        reason: String,
    },

    /// Input tensor shape does not match the descriptor's expected shape
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Shape the descriptor expects for the current batch size
        expected: Shape,
        /// Shape actually supplied
        actual: Shape,
    },

    /// Hardware state diverged from what the driver wrote
    #[error("Data integrity error: {reason}")]
    DataIntegrity {
        /// Reason for failure
        reason: String,
    },

    /// Packed codec was given a datatype it cannot handle
    #[error("Unsupported datatype: {reason}")]
    UnsupportedDatatype {
        /// Reason for failure
        reason: String,
    },

    /// Named engine is absent from the device image's engine table
    #[error("Engine not found in device image: {name}")]
    EngineNotFound {
        /// Engine name that failed to resolve
        name: String,
    },

    /// I/O error while reading weight files
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DriverError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a precondition violation
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    /// Create a data integrity error
    pub fn data_integrity(reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            reason: reason.into(),
        }
    }

    /// Create an unsupported datatype error
    pub fn unsupported_datatype(reason: impl Into<String>) -> Self {
        Self::UnsupportedDatatype {
            reason: reason.into(),
        }
    }

    /// Create an engine-not-found error
    pub fn engine_not_found(name: impl Into<String>) -> Self {
        Self::EngineNotFound { name: name.into() }
    }
}
