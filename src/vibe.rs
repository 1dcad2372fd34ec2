//! Vibe tallies: category counts, percentages and the dominant vibe.

use serde::{Deserialize, Serialize};

use crate::model::Report;

/// Category reported when there is nothing to analyze.
pub const UNKNOWN_VIBE: &str = "unknown";

/// How many ranked categories follow the dominant one in `top_vibes`.
const TOP_VIBES_AFTER_DOMINANT: usize = 3;

/// One category's share of a report set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibeCount {
    pub category: String,
    pub count: usize,
    /// `round(100 * count / total)`, rounded half-up. Percentages across
    /// categories are rounded independently and may not sum to 100.
    pub percentage: u32,
}

impl VibeCount {
    fn unknown() -> Self {
        Self {
            category: UNKNOWN_VIBE.to_string(),
            count: 0,
            percentage: 0,
        }
    }
}

/// The result of analyzing a set of reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibeSummary {
    pub dominant_vibe: VibeCount,
    /// Ranked 2nd through 4th categories; shorter when fewer exist.
    pub top_vibes: Vec<VibeCount>,
    pub total: usize,
}

/// Half-up integer rounding of `100 * count / total`.
fn percentage(count: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((200 * count + total) / (2 * total)) as u32
}

/// Count reports per vibe label, keeping labels in first-seen order.
pub fn count_vibes<'a, I>(reports: I) -> Vec<(&'static str, usize)>
where
    I: IntoIterator<Item = &'a Report>,
{
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for report in reports {
        let label = report.vibe_label();
        match counts.iter_mut().find(|(seen, _)| *seen == label) {
            Some((_, count)) => *count += 1,
            None => counts.push((label, 1)),
        }
    }
    counts
}

/// Analyze a set of reports.
///
/// Ranking is by descending count; ties keep first-encountered order.
/// Empty input yields the `"unknown"` sentinel and no top vibes.
pub fn analyze<'a, I>(reports: I) -> VibeSummary
where
    I: IntoIterator<Item = &'a Report>,
{
    let mut counts = count_vibes(reports);
    let total: usize = counts.iter().map(|(_, count)| count).sum();

    if total == 0 {
        return VibeSummary {
            dominant_vibe: VibeCount::unknown(),
            top_vibes: Vec::new(),
            total: 0,
        };
    }

    // sort_by is stable, so equal counts stay in first-seen order
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    let mut ranked = counts.into_iter().map(|(label, count)| VibeCount {
        category: label.to_string(),
        count,
        percentage: percentage(count, total),
    });

    let dominant_vibe = ranked.next().unwrap_or_else(VibeCount::unknown);
    let top_vibes = ranked.take(TOP_VIBES_AFTER_DOMINANT).collect();

    VibeSummary {
        dominant_vibe,
        top_vibes,
        total,
    }
}
