//! Data models for Vibewatch.
//!
//! A [`Report`] is a single geotagged submission from a user: either an
//! emergency alert or a categorized "vibe" sighting. Reports are owned by
//! the report store; the engine treats every report it sees as an
//! immutable value belonging to a snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Label used when a report is an emergency rather than a vibe sighting.
pub const EMERGENCY_LABEL: &str = "emergency";

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Build coordinates, rejecting values outside the valid ranges.
    pub fn checked(latitude: f64, longitude: f64) -> Result<Self, EngineError> {
        if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
            Ok(Self::new(latitude, longitude))
        } else {
            Err(EngineError::InvalidCoordinates {
                latitude,
                longitude,
            })
        }
    }
}

/// The closed set of vibe categories a sighting can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VibeCategory {
    Safe,
    Calm,
    Lively,
    Festive,
    Crowded,
    Suspicious,
    Dangerous,
    Noisy,
    Quiet,
}

impl VibeCategory {
    pub const ALL: [VibeCategory; 9] = [
        VibeCategory::Safe,
        VibeCategory::Calm,
        VibeCategory::Lively,
        VibeCategory::Festive,
        VibeCategory::Crowded,
        VibeCategory::Suspicious,
        VibeCategory::Dangerous,
        VibeCategory::Noisy,
        VibeCategory::Quiet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VibeCategory::Safe => "safe",
            VibeCategory::Calm => "calm",
            VibeCategory::Lively => "lively",
            VibeCategory::Festive => "festive",
            VibeCategory::Crowded => "crowded",
            VibeCategory::Suspicious => "suspicious",
            VibeCategory::Dangerous => "dangerous",
            VibeCategory::Noisy => "noisy",
            VibeCategory::Quiet => "quiet",
        }
    }
}

impl fmt::Display for VibeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VibeCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VibeCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidCategory(s.to_string()))
    }
}

/// What kind of report this is.
///
/// Emergencies carry no category; a category only has meaning for vibe
/// sightings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportKind {
    Emergency,
    Vibe { category: VibeCategory },
}

/// Up/down vote tallies. These change independently of the report itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub upvotes: i64,
    pub downvotes: i64,
}

/// A single user submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Store-assigned identifier, stable across updates.
    pub id: i64,

    /// Where the report was made, if the device could resolve it.
    pub coordinates: Option<Coordinates>,

    /// Free-text place label typed or geocoded at submission time.
    pub location_name: Option<String>,

    /// Opaque identifier of the submitting user.
    pub author_id: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub votes: VoteCounts,

    #[serde(flatten)]
    pub kind: ReportKind,
}

impl Report {
    pub fn is_emergency(&self) -> bool {
        matches!(self.kind, ReportKind::Emergency)
    }

    pub fn category(&self) -> Option<VibeCategory> {
        match self.kind {
            ReportKind::Vibe { category } => Some(category),
            ReportKind::Emergency => None,
        }
    }

    /// The trimmed location name, or `None` when missing or whitespace-only.
    pub fn label(&self) -> Option<&str> {
        self.location_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// The label this report contributes to vibe tallies.
    pub fn vibe_label(&self) -> &'static str {
        match self.kind {
            ReportKind::Emergency => EMERGENCY_LABEL,
            ReportKind::Vibe { category } => category.as_str(),
        }
    }

    /// A report with neither coordinates nor a usable location name can be
    /// neither clustered nor radius-filtered.
    pub fn is_locatable(&self) -> bool {
        self.coordinates.is_some() || self.label().is_some()
    }
}

/// A report as submitted, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub coordinates: Option<Coordinates>,
    pub location_name: Option<String>,
    pub author_id: String,
    pub kind: ReportKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Up => "up",
            VoteType::Down => "down",
        }
    }
}

// ============================================================================
// Change feed
// ============================================================================

/// Collections the engine watches on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Reports,
    Votes,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Reports => "reports",
            Collection::Votes => "votes",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A mutation on the reports collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportChange {
    pub kind: ChangeKind,
    pub new: Option<Report>,
    pub old: Option<Report>,
    /// When the store committed the mutation.
    pub committed_at: DateTime<Utc>,
}

impl ReportChange {
    /// The id of the affected report, taken from whichever side is present.
    pub fn report_id(&self) -> Option<i64> {
        self.new.as_ref().or(self.old.as_ref()).map(|r| r.id)
    }
}

/// A mutation on the votes collection. Only the affected report matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteChange {
    pub kind: ChangeKind,
    pub report_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Report(ReportChange),
    Vote(VoteChange),
}

impl ChangeEvent {
    pub fn collection(&self) -> Collection {
        match self {
            ChangeEvent::Report(_) => Collection::Reports,
            ChangeEvent::Vote(_) => Collection::Votes,
        }
    }
}

// ============================================================================
// HTTP request types
// ============================================================================

/// Request body for POST /reports.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReportRequest {
    pub author_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_name: Option<String>,
    #[serde(default)]
    pub emergency: bool,
    /// Required unless `emergency` is set.
    pub category: Option<String>,
}

impl CreateReportRequest {
    /// Convert into a [`NewReport`], rejecting malformed input.
    pub fn into_new_report(self, now: DateTime<Utc>) -> Result<NewReport, EngineError> {
        let coordinates = checked_coordinates(self.latitude, self.longitude)?;
        let kind = parse_kind(self.emergency, self.category.as_deref())?;

        Ok(NewReport {
            coordinates,
            location_name: self.location_name,
            author_id: self.author_id,
            kind,
            created_at: now,
        })
    }
}

/// Request body for PUT /reports/{id}. Replaces location and kind; the
/// author and creation time stay as they were.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReportRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_name: Option<String>,
    #[serde(default)]
    pub emergency: bool,
    pub category: Option<String>,
}

impl UpdateReportRequest {
    pub fn into_parts(self) -> Result<(Option<Coordinates>, Option<String>, ReportKind), EngineError> {
        let coordinates = checked_coordinates(self.latitude, self.longitude)?;
        let kind = parse_kind(self.emergency, self.category.as_deref())?;
        Ok((coordinates, self.location_name, kind))
    }
}

fn checked_coordinates(
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<Option<Coordinates>, EngineError> {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => Ok(Some(Coordinates::checked(lat, lon)?)),
        _ => Ok(None),
    }
}

fn parse_kind(emergency: bool, category: Option<&str>) -> Result<ReportKind, EngineError> {
    if emergency {
        return Ok(ReportKind::Emergency);
    }
    Ok(ReportKind::Vibe {
        category: category.unwrap_or_default().parse()?,
    })
}

/// Request body for POST /reports/{id}/votes.
#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    pub user_id: String,
    pub vote: VoteType,
}

/// Request body for PUT /viewers/{id}.
///
/// Either explicit coordinates or a place name to geocode.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerLocationRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub place: Option<String>,
}

/// Query parameters for GET /clusters.
#[derive(Debug, Deserialize)]
pub struct ClustersQuery {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Falls back to the configured cluster distance.
    pub max_distance_km: Option<f64>,
}

/// Query parameters for GET /sentiment.
#[derive(Debug, Deserialize)]
pub struct SentimentQuery {
    pub lat: f64,
    pub lon: f64,
    /// Falls back to the configured notification radius.
    pub radius_km: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: ReportKind, location_name: Option<&str>) -> Report {
        Report {
            id: 1,
            coordinates: None,
            location_name: location_name.map(str::to_string),
            author_id: "u1".to_string(),
            created_at: Utc::now(),
            votes: VoteCounts::default(),
            kind,
        }
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("calm".parse::<VibeCategory>(), Ok(VibeCategory::Calm));
        assert_eq!(" Dangerous ".parse::<VibeCategory>(), Ok(VibeCategory::Dangerous));
        assert_eq!(
            "spooky".parse::<VibeCategory>(),
            Err(EngineError::InvalidCategory("spooky".to_string()))
        );
    }

    #[test]
    fn test_whitespace_location_name_is_no_label() {
        let r = report(ReportKind::Emergency, Some("   "));
        assert_eq!(r.label(), None);
        assert!(!r.is_locatable());

        let r = report(ReportKind::Emergency, Some(" Tahrir Square "));
        assert_eq!(r.label(), Some("Tahrir Square"));
        assert!(r.is_locatable());
    }

    #[test]
    fn test_vibe_label() {
        assert_eq!(report(ReportKind::Emergency, None).vibe_label(), "emergency");
        assert_eq!(
            report(
                ReportKind::Vibe {
                    category: VibeCategory::Noisy
                },
                None
            )
            .vibe_label(),
            "noisy"
        );
    }

    #[test]
    fn test_report_json_shape() {
        let r = report(
            ReportKind::Vibe {
                category: VibeCategory::Festive,
            },
            Some("Zamalek"),
        );
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["kind"], "vibe");
        assert_eq!(value["category"], "festive");
        assert_eq!(value["location_name"], "Zamalek");

        let back: Report = serde_json::from_value(value).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_create_request_requires_category_for_vibes() {
        let request = CreateReportRequest {
            author_id: "u1".to_string(),
            latitude: Some(30.0),
            longitude: Some(31.0),
            location_name: None,
            emergency: false,
            category: None,
        };
        assert!(request.into_new_report(Utc::now()).is_err());
    }

    #[test]
    fn test_create_request_rejects_bad_coordinates() {
        let request = CreateReportRequest {
            author_id: "u1".to_string(),
            latitude: Some(123.0),
            longitude: Some(31.0),
            location_name: None,
            emergency: true,
            category: None,
        };
        assert!(matches!(
            request.into_new_report(Utc::now()),
            Err(EngineError::InvalidCoordinates { .. })
        ));
    }
}
