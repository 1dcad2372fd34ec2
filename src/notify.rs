//! Per-viewer notification decisions for incoming report changes.
//!
//! Each connected viewer owns one [`NotificationDecider`]. For every report
//! change the decider runs, in order:
//!
//! 1. own-report filter (skipped when the viewer id is unknown)
//! 2. duplicate filter for reports this viewer was already notified about
//! 3. cooldown check
//! 4. radius check against the viewer's last known location
//! 5. severity classification and message composition
//!
//! The first rule that matches decides. Only an emitted notification
//! re-arms the cooldown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::{Proximity, ProximityFilter, round_km};
use crate::model::{Coordinates, Report, ReportKind, VibeCategory};

/// Default minimum time between two emitted notifications.
pub const DEFAULT_COOLDOWN_SECS: i64 = 30;

/// Default notification radius.
pub const DEFAULT_NOTIFICATION_RADIUS_KM: f64 = 5.0;

/// How many notified report ids each viewer remembers for duplicate suppression.
const NOTIFIED_MEMORY: usize = 512;

/// Notification severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSeverity {
    /// Ordinary vibe activity.
    Info,
    /// Suspicious, crowded or noisy conditions.
    Warning,
    /// Dangerous conditions.
    Critical,
    /// An SOS/emergency report.
    Emergency,
}

impl NotificationSeverity {
    /// Classify a report by kind and category.
    pub fn of(report: &Report) -> Self {
        match report.kind {
            ReportKind::Emergency => NotificationSeverity::Emergency,
            ReportKind::Vibe { category } => match category {
                VibeCategory::Dangerous => NotificationSeverity::Critical,
                VibeCategory::Suspicious | VibeCategory::Crowded | VibeCategory::Noisy => {
                    NotificationSeverity::Warning
                }
                _ => NotificationSeverity::Info,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NotificationSeverity::Info => "Info",
            NotificationSeverity::Warning => "Warning",
            NotificationSeverity::Critical => "Critical",
            NotificationSeverity::Emergency => "Emergency",
        }
    }
}

/// Whether a report warrants push fan-out to nearby devices.
pub fn should_push(report: &Report) -> bool {
    report.is_emergency() || report.category() == Some(VibeCategory::Dangerous)
}

/// Why a change did not produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    OwnReport,
    AlreadyNotified,
    CooldownActive,
    OutOfRadius,
    UnresolvableLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Triggered by a single report change.
    Report,
    /// Periodic aggregate over recent nearby reports.
    AreaSummary,
}

/// A notification ready to surface to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// The triggering report, for per-report notifications.
    pub report_id: Option<i64>,
    pub severity: NotificationSeverity,
    pub title: String,
    pub message: String,
    pub icon: String,
    /// Distance to the report rounded to one decimal.
    pub distance_km: Option<f64>,
    pub should_push: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of running one change through a viewer's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Suppressed(SuppressReason),
    Emitted(Notification),
}

impl Decision {
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            Decision::Emitted(notification) => Some(notification),
            Decision::Suppressed(_) => None,
        }
    }

    pub fn suppress_reason(&self) -> Option<SuppressReason> {
        match self {
            Decision::Suppressed(reason) => Some(*reason),
            Decision::Emitted(_) => None,
        }
    }
}

// ============================================================================
// Cooldown
// ============================================================================

/// Granularity of the cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// One window shared by every notification.
    #[default]
    Global,
    /// An independent window per severity.
    PerSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CooldownKey {
    Global,
    Severity(NotificationSeverity),
}

/// Last-notification timestamps for one pipeline.
///
/// Every window starts at the Unix epoch, so the first qualifying change
/// always passes.
#[derive(Debug, Clone)]
pub struct CooldownState {
    window: TimeDelta,
    scope: CooldownScope,
    last: HashMap<CooldownKey, DateTime<Utc>>,
}

impl Default for CooldownState {
    fn default() -> Self {
        Self::new(
            TimeDelta::seconds(DEFAULT_COOLDOWN_SECS),
            CooldownScope::default(),
        )
    }
}

impl CooldownState {
    pub fn new(window: TimeDelta, scope: CooldownScope) -> Self {
        Self {
            window,
            scope,
            last: HashMap::new(),
        }
    }

    fn key(&self, severity: NotificationSeverity) -> CooldownKey {
        match self.scope {
            CooldownScope::Global => CooldownKey::Global,
            CooldownScope::PerSeverity => CooldownKey::Severity(severity),
        }
    }

    /// When a notification of this severity last passed.
    pub fn last_notification(&self, severity: NotificationSeverity) -> DateTime<Utc> {
        self.last
            .get(&self.key(severity))
            .copied()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// The most recent accepted notification across all windows.
    pub fn latest(&self) -> DateTime<Utc> {
        self.last
            .values()
            .copied()
            .max()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn is_active(&self, severity: NotificationSeverity, now: DateTime<Utc>) -> bool {
        now - self.last_notification(severity) < self.window
    }

    pub fn record(&mut self, severity: NotificationSeverity, now: DateTime<Utc>) {
        let key = self.key(severity);
        self.last.insert(key, now);
    }
}

/// A bounded FIFO set of report ids.
#[derive(Debug, Clone)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.members.contains(&id)
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.members.remove(&evicted);
        }
        true
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Decider
// ============================================================================

#[derive(Debug)]
struct PipelineState {
    cooldown: CooldownState,
    notified: RecentIds,
}

/// One viewer's notification pipeline.
#[derive(Debug)]
pub struct NotificationDecider {
    viewer_id: Option<String>,
    location: RwLock<Option<Coordinates>>,
    filter: ProximityFilter,
    state: Mutex<PipelineState>,
}

impl NotificationDecider {
    pub fn new(
        viewer_id: Option<String>,
        location: Option<Coordinates>,
        filter: ProximityFilter,
        cooldown: CooldownState,
    ) -> Self {
        Self {
            viewer_id,
            location: RwLock::new(location),
            filter,
            state: Mutex::new(PipelineState {
                cooldown,
                notified: RecentIds::new(NOTIFIED_MEMORY),
            }),
        }
    }

    pub fn viewer_id(&self) -> Option<&str> {
        self.viewer_id.as_deref()
    }

    pub fn radius_km(&self) -> f64 {
        self.filter.radius_km()
    }

    pub fn location(&self) -> Option<Coordinates> {
        *self
            .location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_location(&self, location: Option<Coordinates>) {
        *self
            .location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = location;
    }

    /// Timestamp of the last emitted notification (epoch if none).
    pub fn last_notification_at(&self) -> DateTime<Utc> {
        lock(&self.state).cooldown.latest()
    }

    /// Run one report through the pipeline.
    pub fn decide(&self, report: &Report, now: DateTime<Utc>) -> Decision {
        if let Some(viewer) = self.viewer_id.as_deref()
            && viewer == report.author_id
        {
            return self.suppress(report, SuppressReason::OwnReport);
        }

        let severity = NotificationSeverity::of(report);
        let mut state = lock(&self.state);

        if state.notified.contains(report.id) {
            return self.suppress(report, SuppressReason::AlreadyNotified);
        }

        if state.cooldown.is_active(severity, now) {
            return self.suppress(report, SuppressReason::CooldownActive);
        }

        let distance_km = match self.filter.classify(self.location(), report) {
            Proximity::InRange { distance_km } => distance_km,
            Proximity::OutOfRange { .. } => {
                return self.suppress(report, SuppressReason::OutOfRadius);
            }
            Proximity::Unknown => {
                return self.suppress(report, SuppressReason::UnresolvableLocation);
            }
        };

        state.cooldown.record(severity, now);
        state.notified.insert(report.id);

        Decision::Emitted(compose(report, severity, distance_km, now))
    }

    fn suppress(&self, report: &Report, reason: SuppressReason) -> Decision {
        debug!(
            report_id = report.id,
            viewer = self.viewer_id.as_deref().unwrap_or("-"),
            reason = ?reason,
            "Notification suppressed"
        );
        Decision::Suppressed(reason)
    }
}

/// Build the user-facing copy for a report notification.
fn compose(
    report: &Report,
    severity: NotificationSeverity,
    distance_km: f64,
    now: DateTime<Utc>,
) -> Notification {
    let distance_km = round_km(distance_km);
    let away = format!("{distance_km:.1}km away");
    let place = report
        .label()
        .map(|name| format!(" near {name}"))
        .unwrap_or_default();

    let (title, icon, message) = match report.kind {
        ReportKind::Emergency => (
            "Emergency alert nearby",
            "sos",
            format!("Someone reported an emergency {away}{place}. Stay alert and check on the people around you."),
        ),
        ReportKind::Vibe { category } => match category {
            VibeCategory::Dangerous => (
                "Danger reported nearby",
                "danger",
                format!("A dangerous situation was reported {away}{place}. Avoid the area if you can."),
            ),
            VibeCategory::Suspicious => (
                "Suspicious activity nearby",
                "warning",
                format!("Suspicious activity was reported {away}{place}. Stay aware of your surroundings."),
            ),
            VibeCategory::Crowded => (
                "Crowded area nearby",
                "crowd",
                format!("It is getting crowded {away}{place}."),
            ),
            VibeCategory::Noisy => (
                "Noise reported nearby",
                "noise",
                format!("A noisy situation was reported {away}{place}."),
            ),
            other => (
                "New vibe nearby",
                "info",
                format!("Someone reported a {other} vibe {away}{place}."),
            ),
        },
    };

    Notification {
        kind: NotificationKind::Report,
        report_id: Some(report.id),
        severity,
        title: title.to_string(),
        message,
        icon: icon.to_string(),
        distance_km: Some(distance_km),
        should_push: should_push(report),
        created_at: now,
    }
}
