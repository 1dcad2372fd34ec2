//! Spatial clustering of a report snapshot.
//!
//! # Seed-radius grouping
//!
//! Clusters are grown from seeds in input order. Each unclustered report
//! with coordinates and a location name becomes a seed, and every later
//! unclustered report within `max_distance_km` of *that seed* joins it.
//! There is no centroid refinement and no transitive linking: two reports
//! closer than `max_distance_km` to each other can land in different
//! clusters when neither is within range of the other's seed. The result
//! therefore depends on input order. Callers that need stable output must
//! pass reports in a stable order (the store returns newest first).
//!
//! Reports without coordinates but with a location name are grouped by
//! exact (trimmed) name and centered on the caller's location.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, validate_radius};
use crate::geo::distance_between;
use crate::model::{Coordinates, Report};
use crate::vibe::{self, VibeCount};

/// Default grouping radius.
pub const DEFAULT_MAX_DISTANCE_KM: f64 = 1.0;

/// How a cluster was formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOrigin {
    /// Seed-radius grouping over coordinates.
    Geo,
    /// Exact location-name grouping of reports without coordinates.
    Text,
}

/// A derived, ephemeral group of co-located reports.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    /// Derived from the seed report and generation time. Not stable across runs.
    pub id: String,

    pub origin: ClusterOrigin,

    /// The seed's location name.
    pub location_name: String,

    /// Member centroid, or the caller's location for text clusters.
    pub center: Coordinates,

    pub members: Vec<Report>,

    pub dominant_vibe: VibeCount,

    pub top_vibes: Vec<VibeCount>,

    /// Kilometers from the caller to `center`; 0 without a caller location
    /// and for text clusters.
    pub distance_from_user: f64,

    pub generated_at: DateTime<Utc>,
}

impl Cluster {
    fn new(
        id: String,
        origin: ClusterOrigin,
        location_name: &str,
        center: Coordinates,
        members: Vec<Report>,
        distance_from_user: f64,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let summary = vibe::analyze(&members);
        Self {
            id,
            origin,
            location_name: location_name.to_string(),
            center,
            members,
            dominant_vibe: summary.dominant_vibe,
            top_vibes: summary.top_vibes,
            distance_from_user,
            generated_at,
        }
    }

    pub fn report_count(&self) -> usize {
        self.members.len()
    }
}

/// Groups report snapshots into clusters.
#[derive(Debug, Clone, Copy)]
pub struct ClusterBuilder {
    max_distance_km: f64,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
        }
    }
}

impl ClusterBuilder {
    /// Fails on a negative or non-finite distance.
    pub fn new(max_distance_km: f64) -> Result<Self> {
        Ok(Self {
            max_distance_km: validate_radius(max_distance_km)?,
        })
    }

    pub fn max_distance_km(&self) -> f64 {
        self.max_distance_km
    }

    /// Cluster `reports` relative to an optional caller location.
    ///
    /// Output is sorted by ascending distance from the caller, then by
    /// descending member count.
    pub fn cluster(
        &self,
        reports: &[Report],
        user_location: Option<Coordinates>,
        generated_at: DateTime<Utc>,
    ) -> Vec<Cluster> {
        let mut clusters = self.geo_clusters(reports, user_location, generated_at);
        if let Some(user) = user_location {
            clusters.extend(text_clusters(reports, user, generated_at));
        }

        clusters.sort_by(|a, b| {
            a.distance_from_user
                .total_cmp(&b.distance_from_user)
                .then_with(|| b.members.len().cmp(&a.members.len()))
        });

        clusters
    }

    fn geo_clusters(
        &self,
        reports: &[Report],
        user_location: Option<Coordinates>,
        generated_at: DateTime<Utc>,
    ) -> Vec<Cluster> {
        // Only reports with both coordinates and a name can seed or join.
        let candidates: Vec<(&Report, Coordinates, &str)> = reports
            .iter()
            .filter_map(|r| Some((r, r.coordinates?, r.label()?)))
            .collect();

        let mut processed = vec![false; candidates.len()];
        let mut clusters = Vec::new();

        for (i, &(seed, seed_at, seed_name)) in candidates.iter().enumerate() {
            if processed[i] {
                continue;
            }
            processed[i] = true;

            let mut members = vec![seed.clone()];
            for (j, &(other, other_at, _)) in candidates.iter().enumerate().skip(i + 1) {
                if !processed[j] && distance_between(seed_at, other_at) <= self.max_distance_km {
                    processed[j] = true;
                    members.push(other.clone());
                }
            }

            let center = centroid(&members);
            let distance_from_user = user_location
                .map(|user| distance_between(user, center))
                .unwrap_or(0.0);

            clusters.push(Cluster::new(
                format!("geo-{}-{}", seed.id, generated_at.timestamp_millis()),
                ClusterOrigin::Geo,
                seed_name,
                center,
                members,
                distance_from_user,
                generated_at,
            ));
        }

        clusters
    }
}

/// Group coordinate-less reports by location name, centered on the caller.
fn text_clusters(
    reports: &[Report],
    user_location: Coordinates,
    generated_at: DateTime<Utc>,
) -> Vec<Cluster> {
    let mut groups: Vec<(&str, Vec<Report>)> = Vec::new();

    for report in reports.iter().filter(|r| r.coordinates.is_none()) {
        let Some(name) = report.label() else {
            continue;
        };
        match groups.iter_mut().find(|(seen, _)| *seen == name) {
            Some((_, members)) => members.push(report.clone()),
            None => groups.push((name, vec![report.clone()])),
        }
    }

    groups
        .into_iter()
        .map(|(name, members)| {
            Cluster::new(
                format!("text-{}-{}", members[0].id, generated_at.timestamp_millis()),
                ClusterOrigin::Text,
                name,
                user_location,
                members,
                0.0,
                generated_at,
            )
        })
        .collect()
}

/// Arithmetic mean of member coordinates. Members without coordinates are ignored.
fn centroid(members: &[Report]) -> Coordinates {
    let points: Vec<Coordinates> = members.iter().filter_map(|r| r.coordinates).collect();
    let n = points.len().max(1) as f64;
    let (lat, lon) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.latitude, lon + p.longitude));
    Coordinates::new(lat / n, lon / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReportKind, VibeCategory, VoteCounts};

    // 0.0045 degrees of latitude is ~500 m
    const HALF_KM_LAT: f64 = 0.0045;

    fn report(id: i64, at: Option<(f64, f64)>, name: Option<&str>, category: VibeCategory) -> Report {
        Report {
            id,
            coordinates: at.map(|(lat, lon)| Coordinates::new(lat, lon)),
            location_name: name.map(str::to_string),
            author_id: format!("user-{id}"),
            created_at: Utc::now(),
            votes: VoteCounts::default(),
            kind: ReportKind::Vibe { category },
        }
    }

    fn ids(cluster: &Cluster) -> Vec<i64> {
        cluster.members.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_empty_input() {
        let clusters = ClusterBuilder::default().cluster(&[], Some(Coordinates::new(0.0, 0.0)), Utc::now());
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_reports_500m_apart_form_one_cluster() {
        let reports = vec![
            report(1, Some((30.0, 31.0)), Some("Garden City"), VibeCategory::Calm),
            report(2, Some((30.0 + HALF_KM_LAT, 31.0)), Some("Garden City"), VibeCategory::Calm),
        ];

        let clusters = ClusterBuilder::default().cluster(&reports, None, Utc::now());

        assert_eq!(clusters.len(), 1);
        assert_eq!(ids(&clusters[0]), vec![1, 2]);
        assert_eq!(clusters[0].origin, ClusterOrigin::Geo);
        assert_eq!(clusters[0].distance_from_user, 0.0);
        assert!((clusters[0].center.latitude - (30.0 + HALF_KM_LAT / 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_reports_2km_apart_form_two_clusters() {
        let reports = vec![
            report(1, Some((30.0, 31.0)), Some("Garden City"), VibeCategory::Calm),
            report(2, Some((30.018, 31.0)), Some("Garden City"), VibeCategory::Calm),
        ];

        let clusters = ClusterBuilder::default().cluster(&reports, None, Utc::now());

        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_grouping_is_seed_based_not_transitive() {
        // B is 0.8 km from A and from C; A and C are 1.6 km apart.
        let a = report(1, Some((30.0, 31.0)), Some("Corniche"), VibeCategory::Lively);
        let b = report(2, Some((30.0072, 31.0)), Some("Corniche"), VibeCategory::Lively);
        let c = report(3, Some((30.0144, 31.0)), Some("Corniche"), VibeCategory::Lively);
        let builder = ClusterBuilder::default();

        let seeded_by_a = builder.cluster(&[a.clone(), b.clone(), c.clone()], None, Utc::now());
        let mut groups: Vec<_> = seeded_by_a.iter().map(ids).collect();
        groups.sort();
        assert_eq!(groups, vec![vec![1, 2], vec![3]]);

        let seeded_by_b = builder.cluster(&[b, a, c], None, Utc::now());
        assert_eq!(seeded_by_b.len(), 1);
        assert_eq!(ids(&seeded_by_b[0]), vec![2, 1, 3]);
    }

    #[test]
    fn test_unlabeled_and_unlocatable_reports_are_dropped() {
        let reports = vec![
            report(1, Some((30.0, 31.0)), None, VibeCategory::Calm),
            report(2, Some((30.0, 31.0)), Some("  "), VibeCategory::Calm),
            report(3, None, None, VibeCategory::Calm),
            report(4, Some((30.0, 31.0)), Some("Maadi"), VibeCategory::Quiet),
        ];

        let clusters =
            ClusterBuilder::default().cluster(&reports, Some(Coordinates::new(30.0, 31.0)), Utc::now());

        assert_eq!(clusters.len(), 1);
        assert_eq!(ids(&clusters[0]), vec![4]);
    }

    #[test]
    fn test_text_clusters_need_user_location() {
        let reports = vec![
            report(1, None, Some("Heliopolis"), VibeCategory::Crowded),
            report(2, None, Some("Heliopolis"), VibeCategory::Noisy),
            report(3, None, Some("Dokki"), VibeCategory::Calm),
        ];
        let builder = ClusterBuilder::default();

        assert!(builder.cluster(&reports, None, Utc::now()).is_empty());

        let user = Coordinates::new(30.05, 31.2);
        let clusters = builder.cluster(&reports, Some(user), Utc::now());

        assert_eq!(clusters.len(), 2);
        // Equal distance (0), larger group first
        assert_eq!(clusters[0].location_name, "Heliopolis");
        assert_eq!(ids(&clusters[0]), vec![1, 2]);
        assert_eq!(clusters[0].center, user);
        assert_eq!(clusters[0].distance_from_user, 0.0);
        assert_eq!(clusters[0].origin, ClusterOrigin::Text);
        assert_eq!(clusters[1].location_name, "Dokki");
    }

    #[test]
    fn test_sorted_by_distance_then_size() {
        let reports = vec![
            report(1, Some((30.1, 31.0)), Some("Far"), VibeCategory::Calm),
            report(2, Some((30.01, 31.0)), Some("Near"), VibeCategory::Calm),
            report(3, Some((30.05, 31.0)), Some("Middle"), VibeCategory::Calm),
        ];

        let clusters =
            ClusterBuilder::default().cluster(&reports, Some(Coordinates::new(30.0, 31.0)), Utc::now());

        let names: Vec<_> = clusters.iter().map(|c| c.location_name.as_str()).collect();
        assert_eq!(names, vec!["Near", "Middle", "Far"]);
        assert!(clusters[0].distance_from_user < clusters[1].distance_from_user);
    }

    #[test]
    fn test_cluster_vibe_summary() {
        let reports = vec![
            report(1, Some((30.0, 31.0)), Some("Zamalek"), VibeCategory::Festive),
            report(2, Some((30.001, 31.0)), Some("Zamalek"), VibeCategory::Crowded),
            report(3, Some((30.002, 31.0)), Some("Zamalek"), VibeCategory::Festive),
        ];

        let clusters = ClusterBuilder::default().cluster(&reports, None, Utc::now());

        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.dominant_vibe.category, "festive");
        assert_eq!(cluster.dominant_vibe.count, 2);
        assert_eq!(cluster.dominant_vibe.percentage, 67);
        assert_eq!(cluster.top_vibes.len(), 1);
        let counted: usize = cluster.dominant_vibe.count + cluster.top_vibes.iter().map(|v| v.count).sum::<usize>();
        assert_eq!(counted, cluster.report_count());
    }

    #[test]
    fn test_cluster_ids_derive_from_seed_and_time() {
        let now = Utc::now();
        let reports = vec![report(42, Some((30.0, 31.0)), Some("Giza"), VibeCategory::Safe)];

        let clusters = ClusterBuilder::default().cluster(&reports, None, now);

        assert_eq!(clusters[0].id, format!("geo-42-{}", now.timestamp_millis()));
    }

    #[test]
    fn test_negative_distance_rejected() {
        assert!(ClusterBuilder::new(-1.0).is_err());
        assert!(ClusterBuilder::new(2.5).is_ok());
    }
}
