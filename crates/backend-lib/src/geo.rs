// ============================
// crates/backend-lib/src/geo.rs
// ============================
//! Coordinate validation.
//!
//! Every operation that writes a location sample funnels through
//! [`validate`] first. Pure, no side effects.

use crate::error::AppError;
use rendezvous_common::LatLng;

pub const LAT_MIN: f64 = -90.0;
pub const LAT_MAX: f64 = 90.0;
pub const LNG_MIN: f64 = -180.0;
pub const LNG_MAX: f64 = 180.0;

/// Validate a latitude/longitude pair.
///
/// Both components must be present; latitude must lie in [-90, 90] and
/// longitude in [-180, 180]. NaN fails the range check.
pub fn validate(lat: Option<f64>, lng: Option<f64>) -> Result<LatLng, AppError> {
    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err(AppError::MissingCoordinate);
    };
    if !(LAT_MIN..=LAT_MAX).contains(&lat) {
        return Err(AppError::InvalidLatitude(lat));
    }
    if !(LNG_MIN..=LNG_MAX).contains(&lng) {
        return Err(AppError::InvalidLongitude(lng));
    }
    Ok(LatLng { lat, lng })
}
