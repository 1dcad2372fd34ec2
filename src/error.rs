//! Error types for programmer errors in the engine.
//!
//! Data-shape problems (a report without coordinates, an unknown viewer
//! location) are never errors: they degrade to exclusion or suppression.
//! Transport problems are logged and retried or dropped where they happen.
//! What remains here are caller bugs, which should fail fast.

use thiserror::Error;

/// Result alias for engine constructors and validators.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A radius or distance threshold that is negative, NaN or infinite.
    #[error("invalid radius: {0} km (must be finite and non-negative)")]
    InvalidRadius(f64),

    /// A category string outside the closed vibe enumeration.
    #[error("invalid vibe category: {0:?}")]
    InvalidCategory(String),

    /// Latitude/longitude outside of the valid WGS84 ranges.
    #[error("invalid coordinates: ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    /// Backoff settings that cannot produce a sane delay sequence.
    #[error("invalid backoff policy: {0}")]
    InvalidBackoff(String),

    /// Configuration value that could not be parsed or is out of range.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Reject radii that would make distance comparisons meaningless.
pub fn validate_radius(radius_km: f64) -> Result<f64> {
    if radius_km.is_finite() && radius_km >= 0.0 {
        Ok(radius_km)
    } else {
        Err(EngineError::InvalidRadius(radius_km))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_radius() {
        assert_eq!(validate_radius(5.0), Ok(5.0));
        assert_eq!(validate_radius(0.0), Ok(0.0));
        assert!(validate_radius(-1.0).is_err());
        assert!(validate_radius(f64::NAN).is_err());
        assert!(validate_radius(f64::INFINITY).is_err());
    }
}
