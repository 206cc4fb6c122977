//! Error types for the localization filter
//!
//! Every failure mode is fatal to the cycle that produced it. The filter never retries
//! internally; the caller decides whether to re-initialize, relax parameters, or stop.

use thiserror::Error;

/// Localization error type
#[derive(Error, Debug)]
pub enum FilterError {
    /// An operation other than `initialize` was called on an uninitialized filter.
    #[error("particle filter has not been initialized")]
    NotInitialized,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// All weights are zero, negative, or non-finite at a point where they must be normalized.
    #[error("degenerate particle weights: {0}")]
    DegenerateWeights(String),

    /// A pose, likelihood, or weight became NaN or infinite.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Returns `InvalidInput` unless `value` is finite and strictly positive.
pub(crate) fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FilterError::InvalidInput(format!(
            "{name} must be finite and positive, got {value}"
        )))
    }
}

/// Returns `InvalidInput` unless `value` is finite and non-negative.
pub(crate) fn require_non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FilterError::InvalidInput(format!(
            "{name} must be finite and non-negative, got {value}"
        )))
    }
}

pub(crate) fn require_finite(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FilterError::InvalidInput(format!(
            "{name} must be finite, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_positive() {
        assert!(require_positive("dt", 0.1).is_ok());
        assert!(matches!(
            require_positive("dt", 0.0),
            Err(FilterError::InvalidInput(_))
        ));
        assert!(require_positive("dt", -1.0).is_err());
        assert!(require_positive("dt", f64::NAN).is_err());
        assert!(require_positive("dt", f64::INFINITY).is_err());
    }

    #[test]
    fn test_require_non_negative() {
        assert!(require_non_negative("std", 0.0).is_ok());
        assert!(require_non_negative("std", 2.0).is_ok());
        assert!(require_non_negative("std", -0.1).is_err());
        assert!(require_non_negative("std", f64::NAN).is_err());
    }

    #[test]
    fn test_error_messages() {
        let err = require_finite("velocity", f64::NAN).unwrap_err();
        assert!(err.to_string().contains("velocity"));
        assert_eq!(
            FilterError::NotInitialized.to_string(),
            "particle filter has not been initialized"
        );
    }
}
