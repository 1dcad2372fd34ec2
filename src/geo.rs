//! Distance math and radius membership.

use serde::{Deserialize, Serialize};

use crate::error::{Result, validate_radius};
use crate::model::{Coordinates, Report};

/// Mean Earth radius used by the Haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers per degree of latitude (and of longitude at the equator).
const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// Great-circle distance in kilometers between two points given in degrees.
///
/// NaN inputs propagate to a NaN result; callers guard against missing
/// coordinates before calling.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// [`distance_km`] over [`Coordinates`].
pub fn distance_between(a: Coordinates, b: Coordinates) -> f64 {
    distance_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Round a distance to one decimal place for display.
pub fn round_km(distance_km: f64) -> f64 {
    (distance_km * 10.0).round() / 10.0
}

/// An axis-aligned box in degrees, used as a coarse geofilter for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl Bounds {
    /// The smallest box that contains the circle of `radius_km` around `center`.
    ///
    /// The box over-approximates the circle; exact membership is decided
    /// afterwards with [`distance_between`].
    pub fn around(center: Coordinates, radius_km: f64) -> Self {
        let d_lat = radius_km / KM_PER_DEGREE;
        let cos_lat = center.latitude.to_radians().cos().abs();
        let d_lon = if cos_lat < 1e-9 {
            180.0
        } else {
            (radius_km / (KM_PER_DEGREE * cos_lat)).min(180.0)
        };

        Self {
            min_latitude: (center.latitude - d_lat).max(-90.0),
            max_latitude: (center.latitude + d_lat).min(90.0),
            min_longitude: (center.longitude - d_lon).max(-180.0),
            max_longitude: (center.longitude + d_lon).min(180.0),
        }
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }
}

/// Where a report sits relative to a viewer's radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Proximity {
    InRange { distance_km: f64 },
    OutOfRange { distance_km: f64 },
    /// The viewer location or the report coordinates are missing.
    Unknown,
}

impl Proximity {
    pub fn is_in_range(&self) -> bool {
        matches!(self, Proximity::InRange { .. })
    }

    pub fn distance_km(&self) -> Option<f64> {
        match *self {
            Proximity::InRange { distance_km } | Proximity::OutOfRange { distance_km } => {
                Some(distance_km)
            }
            Proximity::Unknown => None,
        }
    }
}

/// Radius membership test with a validated radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityFilter {
    radius_km: f64,
}

impl ProximityFilter {
    /// Fails on a negative or non-finite radius.
    pub fn new(radius_km: f64) -> Result<Self> {
        Ok(Self {
            radius_km: validate_radius(radius_km)?,
        })
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    pub fn classify(&self, user_location: Option<Coordinates>, report: &Report) -> Proximity {
        let (Some(user), Some(at)) = (user_location, report.coordinates) else {
            return Proximity::Unknown;
        };

        let distance_km = distance_between(user, at);
        if distance_km <= self.radius_km {
            Proximity::InRange { distance_km }
        } else {
            Proximity::OutOfRange { distance_km }
        }
    }

    /// Two-valued view of [`classify`](Self::classify): missing data reads as `false`.
    pub fn within_radius(&self, user_location: Option<Coordinates>, report: &Report) -> bool {
        self.classify(user_location, report).is_in_range()
    }
}
