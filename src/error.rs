//! Error types for DCC decoding

use thiserror::Error;

/// Result type for DCC decoder operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Errors raised before or outside the decode loop.
///
/// Everything detected *during* decoding (bad preambles, checksum
/// mismatches, out-of-tolerance timing) is reported as an [`Annotation`]
/// on the output timeline and never surfaces here. Only configuration
/// problems that make decoding impossible are real errors.
///
/// [`Annotation`]: crate::core::Annotation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Sample rate missing, zero or negative
    #[error("Invalid sample rate: {0}")]
    SampleRate(String),

    /// A timing profile violates its min/max invariants
    #[error("Invalid timing profile: {0}")]
    InvalidProfile(String),

    /// An address or CV value is outside its legal range
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A configuration value is outside its legal range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DecodeError {
    /// Create a new SampleRate error
    pub fn sample_rate(msg: impl Into<String>) -> Self {
        DecodeError::SampleRate(msg.into())
    }

    /// Create a new InvalidProfile error
    pub fn invalid_profile(msg: impl Into<String>) -> Self {
        DecodeError::InvalidProfile(msg.into())
    }

    /// Create a new InvalidAddress error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        DecodeError::InvalidAddress(msg.into())
    }

    /// Create a new InvalidConfig error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        DecodeError::InvalidConfig(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::sample_rate("rate is 0");
        assert!(err.to_string().contains("Invalid sample rate"));

        let err = DecodeError::invalid_address("CV 0 out of range");
        assert!(err.to_string().contains("Invalid address"));
    }
}
