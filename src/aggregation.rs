//! Aggregate views over nearby reports: periodic area summaries and
//! on-demand local sentiment.
//!
//! Neither path touches the per-event cooldown. Area summaries run on their
//! own timer; local sentiment is a pure read over a snapshot.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::geo::{Bounds, ProximityFilter, distance_between};
use crate::geocoder::Geocoder;
use crate::model::{Coordinates, Report, VibeCategory};
use crate::notify::{Notification, NotificationKind, NotificationSeverity};
use crate::store::{ReportQuery, ReportStore};
use crate::vibe::{self, VibeSummary};

/// Default area-summary lookback.
pub const DEFAULT_SUMMARY_LOOKBACK_MINUTES: u32 = 60;

/// Default number of qualifying reports needed for an area summary.
pub const DEFAULT_SUMMARY_MIN_REPORTS: usize = 3;

/// Vibe breakdown of the reports around a point.
#[derive(Debug, Clone, Serialize)]
pub struct LocalSentiment {
    pub center: Coordinates,
    pub radius_km: f64,
    pub report_count: usize,
    pub summary: VibeSummary,
    /// Geocoded name of the area, when a geocoder is available.
    pub area_label: Option<String>,
}

/// Analyze the reports with coordinates inside `filter`'s radius of `center`.
pub fn local_sentiment(
    reports: &[Report],
    center: Coordinates,
    filter: &ProximityFilter,
) -> LocalSentiment {
    let nearby: Vec<&Report> = reports
        .iter()
        .filter(|r| filter.within_radius(Some(center), r))
        .collect();

    LocalSentiment {
        center,
        radius_km: filter.radius_km(),
        report_count: nearby.len(),
        summary: vibe::analyze(nearby.iter().copied()),
        area_label: None,
    }
}

/// Best-effort reverse geocode. Failures are logged and become `None`.
pub async fn label_area(geocoder: Option<&dyn Geocoder>, at: Coordinates) -> Option<String> {
    let geocoder = geocoder?;
    match geocoder.reverse_geocode(at).await {
        Ok(label) => Some(label),
        Err(e) => {
            debug!(error = %e, "Reverse geocoding failed");
            None
        }
    }
}

/// Build an area summary for a viewer location.
///
/// Fetches reports created within `lookback_minutes` before `now`, keeps
/// those within the radius, and returns a notification only when at least
/// `min_reports` qualify. The severity is chosen by the most severe class
/// present: any emergency, then any dangerous report, then plain activity.
///
/// # Arguments
///
/// * `store` - Report store to query
/// * `location` - The viewer's location
/// * `filter` - Radius filter for the viewer
/// * `lookback_minutes` - How far back to look for reports
/// * `min_reports` - Minimum qualifying reports to emit a summary
/// * `now` - Reference timestamp
pub async fn area_summary(
    store: &dyn ReportStore,
    location: Coordinates,
    filter: &ProximityFilter,
    lookback_minutes: u32,
    min_reports: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<Notification>> {
    let since = now - TimeDelta::minutes(i64::from(lookback_minutes));
    let query =
        ReportQuery::since(since).within(Bounds::around(location, filter.radius_km()));

    let reports = store.query(&query).await?;
    let recent: Vec<Report> = reports
        .into_iter()
        .filter(|r| r.created_at >= since && r.created_at <= now)
        .filter(|r| filter.within_radius(Some(location), r))
        .collect();

    if recent.len() < min_reports.max(1) {
        debug!(
            qualifying = recent.len(),
            min_reports, "Not enough nearby activity for an area summary"
        );
        return Ok(None);
    }

    Ok(Some(compose_summary(
        &recent,
        location,
        filter.radius_km(),
        lookback_minutes,
        now,
    )))
}

/// Generate the summary notification for a qualifying batch.
fn compose_summary(
    reports: &[Report],
    location: Coordinates,
    radius_km: f64,
    lookback_minutes: u32,
    now: DateTime<Utc>,
) -> Notification {
    let total = reports.len();
    let window = describe_window(lookback_minutes);
    let emergencies = reports.iter().filter(|r| r.is_emergency()).count();
    let dangerous = reports
        .iter()
        .filter(|r| r.category() == Some(VibeCategory::Dangerous))
        .count();

    let (severity, title, icon, message) = if emergencies > 0 {
        (
            NotificationSeverity::Emergency,
            "Emergencies reported in your area",
            "sos",
            format!(
                "{emergencies} emergency {} and {total} reports in total within {radius_km:.1}km in the last {window}.",
                plural(emergencies, "report", "reports")
            ),
        )
    } else if dangerous > 0 {
        (
            NotificationSeverity::Critical,
            "Danger reported in your area",
            "danger",
            format!(
                "{dangerous} dangerous {} among {total} reports within {radius_km:.1}km in the last {window}.",
                plural(dangerous, "situation", "situations")
            ),
        )
    } else {
        let summary = vibe::analyze(reports);
        (
            NotificationSeverity::Info,
            "Activity in your area",
            "info",
            format!(
                "{total} new reports within {radius_km:.1}km in the last {window}. The vibe is mostly {} ({}%).",
                summary.dominant_vibe.category, summary.dominant_vibe.percentage
            ),
        )
    };

    // Nearest report, for display
    let distance_km = reports
        .iter()
        .filter_map(|r| r.coordinates)
        .map(|at| distance_between(location, at))
        .min_by(f64::total_cmp)
        .map(crate::geo::round_km);

    Notification {
        kind: NotificationKind::AreaSummary,
        report_id: None,
        severity,
        title: title.to_string(),
        message,
        icon: icon.to_string(),
        distance_km,
        should_push: false,
        created_at: now,
    }
}

fn describe_window(minutes: u32) -> String {
    match minutes {
        60 => "hour".to_string(),
        m if m % 60 == 0 => format!("{} hours", m / 60),
        1 => "minute".to_string(),
        m => format!("{m} minutes"),
    }
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 { one } else { many }
}
