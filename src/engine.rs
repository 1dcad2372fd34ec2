//! The event router.
//!
//! [`Engine`] keeps the state the HTTP surface and background tasks share:
//!
//! - a registry of connected viewers, each with its own
//!   [`NotificationDecider`] and a bounded outbox of recent notifications
//! - a copy-on-read snapshot of recent reports, used for clustering and
//!   local sentiment
//! - optional push and geocoding collaborators
//!
//! It implements [`ChangeSink`], so a [`crate::realtime::RealtimeSubscriptionManager`]
//! feeds it store mutations directly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::aggregation::{self, LocalSentiment};
use crate::cluster::{Cluster, ClusterBuilder};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::geo::ProximityFilter;
use crate::geocoder::Geocoder;
use crate::model::{ChangeKind, Collection, Coordinates, Report, ReportChange, VoteChange};
use crate::notify::{CooldownState, Decision, Notification, NotificationDecider, lock};
use crate::push::PushDispatcher;
use crate::realtime::ChangeSink;
use crate::store::{ReportQuery, ReportStore};

/// Notifications kept per viewer.
pub const OUTBOX_CAPACITY: usize = 50;

const BROADCAST_CAPACITY: usize = 256;

/// A notification addressed to one viewer.
#[derive(Debug, Clone, Serialize)]
pub struct ViewerNotification {
    pub viewer_id: String,
    pub notification: Notification,
}

struct Viewer {
    decider: NotificationDecider,
    outbox: Mutex<VecDeque<Notification>>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ReportStore>,
    notification_filter: ProximityFilter,
    cluster_builder: ClusterBuilder,
    viewers: RwLock<HashMap<String, Arc<Viewer>>>,
    snapshot: RwLock<Arc<Vec<Report>>>,
    push: Option<PushDispatcher>,
    geocoder: Option<Arc<dyn Geocoder>>,
    notifications: broadcast::Sender<ViewerNotification>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    /// Fails if the configured radii are invalid.
    pub fn new(config: EngineConfig, store: Arc<dyn ReportStore>) -> Result<Self> {
        let notification_filter = ProximityFilter::new(config.notification_radius_km)?;
        let cluster_builder = ClusterBuilder::new(config.cluster_distance_km)?;
        let (notifications, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self {
            config,
            store,
            notification_filter,
            cluster_builder,
            viewers: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            push: None,
            geocoder: None,
            notifications,
        })
    }

    pub fn with_push(mut self, push: PushDispatcher) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Viewers
    // ========================================================================

    /// Register a viewer, or move an existing one. Returns `true` if the
    /// viewer is new.
    pub fn register_viewer(&self, viewer_id: &str, location: Option<Coordinates>) -> bool {
        if let Some(viewer) = read(&self.viewers).get(viewer_id) {
            viewer.decider.set_location(location);
            return false;
        }

        let mut viewers = write(&self.viewers);
        if let Some(viewer) = viewers.get(viewer_id) {
            viewer.decider.set_location(location);
            return false;
        }

        let decider = NotificationDecider::new(
            Some(viewer_id.to_string()),
            location,
            self.notification_filter,
            CooldownState::new(self.config.cooldown, self.config.cooldown_scope),
        );
        viewers.insert(
            viewer_id.to_string(),
            Arc::new(Viewer {
                decider,
                outbox: Mutex::new(VecDeque::new()),
            }),
        );
        info!(viewer = viewer_id, "Viewer registered");
        true
    }

    pub fn unregister_viewer(&self, viewer_id: &str) -> bool {
        let removed = write(&self.viewers).remove(viewer_id).is_some();
        if removed {
            info!(viewer = viewer_id, "Viewer unregistered");
        }
        removed
    }

    pub fn viewer_count(&self) -> usize {
        read(&self.viewers).len()
    }

    pub fn viewer_location(&self, viewer_id: &str) -> Option<Option<Coordinates>> {
        read(&self.viewers)
            .get(viewer_id)
            .map(|v| v.decider.location())
    }

    /// Recent notifications for a viewer, newest first. `None` for an
    /// unknown viewer.
    pub fn notifications(&self, viewer_id: &str) -> Option<Vec<Notification>> {
        let viewer = read(&self.viewers).get(viewer_id).cloned()?;
        let outbox = lock(&viewer.outbox);
        Some(outbox.iter().rev().cloned().collect())
    }

    /// Live stream of every notification delivered to any viewer.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ViewerNotification> {
        self.notifications.subscribe()
    }

    fn viewers(&self) -> Vec<(String, Arc<Viewer>)> {
        read(&self.viewers)
            .iter()
            .map(|(id, viewer)| (id.clone(), Arc::clone(viewer)))
            .collect()
    }

    fn deliver(&self, viewer_id: &str, viewer: &Viewer, notification: Notification) {
        {
            let mut outbox = lock(&viewer.outbox);
            outbox.push_back(notification.clone());
            while outbox.len() > OUTBOX_CAPACITY {
                outbox.pop_front();
            }
        }

        // Err only means no live listeners
        let _ = self.notifications.send(ViewerNotification {
            viewer_id: viewer_id.to_string(),
            notification,
        });
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// The current report snapshot. Cheap; never blocks writers for long.
    pub fn snapshot(&self) -> Arc<Vec<Report>> {
        Arc::clone(&read(&self.snapshot))
    }

    /// Replace the snapshot with every report inside the lookback window.
    pub async fn refresh_snapshot(&self) -> anyhow::Result<usize> {
        let since = Utc::now() - self.config.snapshot_lookback;
        let mut query = ReportQuery::since(since);
        let mut reports = Vec::new();

        loop {
            let page = self.store.query(&query).await?;
            let short = page.len() < query.limit as usize;
            reports.extend(page);
            if short {
                break;
            }
            query.offset += query.limit;
        }
        // An insert between pages shifts the next page by one row
        reports.dedup_by_key(|r| r.id);

        let count = reports.len();
        *write(&self.snapshot) = Arc::new(reports);

        debug!(reports = count, "Snapshot refreshed");
        Ok(count)
    }

    fn upsert_snapshot(&self, report: &Report) {
        let mut guard = write(&self.snapshot);
        let reports = Arc::make_mut(&mut guard);
        match reports.iter_mut().find(|r| r.id == report.id) {
            Some(existing) => *existing = report.clone(),
            None => reports.insert(0, report.clone()),
        }
    }

    fn remove_from_snapshot(&self, report_id: i64) {
        let mut guard = write(&self.snapshot);
        if guard.iter().any(|r| r.id == report_id) {
            Arc::make_mut(&mut guard).retain(|r| r.id != report_id);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cluster the snapshot around an optional caller location.
    pub fn clusters(
        &self,
        user_location: Option<Coordinates>,
        max_distance_km: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Cluster>> {
        let builder = match max_distance_km {
            Some(km) => ClusterBuilder::new(km)?,
            None => self.cluster_builder,
        };
        Ok(builder.cluster(&self.snapshot(), user_location, now))
    }

    /// Vibe breakdown around `center`, labeled when a geocoder is available.
    pub async fn local_sentiment(
        &self,
        center: Coordinates,
        radius_km: Option<f64>,
    ) -> Result<LocalSentiment> {
        let filter = match radius_km {
            Some(km) => ProximityFilter::new(km)?,
            None => self.notification_filter,
        };

        let mut sentiment = aggregation::local_sentiment(&self.snapshot(), center, &filter);
        sentiment.area_label = aggregation::label_area(self.geocoder.as_deref(), center).await;
        Ok(sentiment)
    }

    /// Resolve a free-text place. `Ok(None)` when no geocoder is configured
    /// or nothing matched.
    pub async fn resolve_place(&self, place: &str) -> anyhow::Result<Option<Coordinates>> {
        match &self.geocoder {
            Some(geocoder) => geocoder.forward_geocode(place).await,
            None => Ok(None),
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Run a report through every viewer's pipeline. Returns how many
    /// notifications were emitted.
    pub fn route_report(&self, report: &Report, now: DateTime<Utc>) -> usize {
        let mut emitted = 0;
        let mut push_candidate: Option<Notification> = None;

        for (viewer_id, viewer) in self.viewers() {
            let Decision::Emitted(notification) = viewer.decider.decide(report, now) else {
                continue;
            };

            info!(
                report_id = report.id,
                viewer = %viewer_id,
                severity = notification.severity.label(),
                distance_km = notification.distance_km,
                "Notification emitted"
            );

            if notification.should_push && push_candidate.is_none() {
                push_candidate = Some(notification.clone());
            }
            self.deliver(&viewer_id, &viewer, notification);
            emitted += 1;
        }

        if let (Some(push), Some(notification)) = (&self.push, push_candidate) {
            push.dispatch(report, &notification);
        }

        emitted
    }

    /// Post an area summary to every located viewer with enough nearby
    /// activity. Returns how many summaries were delivered.
    pub async fn run_area_summaries(&self, now: DateTime<Utc>) -> usize {
        let mut delivered = 0;

        for (viewer_id, viewer) in self.viewers() {
            let Some(location) = viewer.decider.location() else {
                continue;
            };

            let summary = aggregation::area_summary(
                self.store.as_ref(),
                location,
                &self.notification_filter,
                self.config.summary_lookback_minutes,
                self.config.summary_min_reports,
                now,
            )
            .await;

            match summary {
                Ok(Some(mut notification)) => {
                    if let Some(label) =
                        aggregation::label_area(self.geocoder.as_deref(), location).await
                    {
                        notification.message = format!("Around {label}: {}", notification.message);
                    }
                    info!(
                        viewer = %viewer_id,
                        severity = notification.severity.label(),
                        "Area summary delivered"
                    );
                    self.deliver(&viewer_id, &viewer, notification);
                    delivered += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(viewer = %viewer_id, error = %e, "Area summary failed"),
            }
        }

        delivered
    }
}

#[async_trait]
impl ChangeSink for Engine {
    async fn on_report_change(&self, change: ReportChange) {
        // Measured from the commit, so a backlog does not stack delays
        let waited = (Utc::now() - change.committed_at)
            .to_std()
            .unwrap_or_default();
        if let Some(remaining) = self.config.route_delay.checked_sub(waited)
            && !remaining.is_zero()
        {
            tokio::time::sleep(remaining).await;
        }

        match change.kind {
            ChangeKind::Delete => {
                if let Some(id) = change.report_id() {
                    self.remove_from_snapshot(id);
                    debug!(report_id = id, "Report removed from snapshot");
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(report) = change.new else {
                    debug!("Report change without a new row");
                    return;
                };
                self.upsert_snapshot(&report);
                self.route_report(&report, Utc::now());
            }
        }
    }

    async fn on_vote_change(&self, change: VoteChange) {
        match self.store.vote_counts(change.report_id).await {
            Ok(Some(votes)) => {
                let mut guard = write(&self.snapshot);
                if guard.iter().any(|r| r.id == change.report_id) {
                    let reports = Arc::make_mut(&mut guard);
                    for report in reports.iter_mut().filter(|r| r.id == change.report_id) {
                        report.votes = votes;
                    }
                }
            }
            Ok(None) => debug!(report_id = change.report_id, "Vote for unknown report"),
            Err(e) => warn!(report_id = change.report_id, error = %e, "Failed to refresh vote counts"),
        }
    }

    async fn on_feed_lagged(&self, collection: Collection, missed: u64) {
        info!(%collection, missed, "Refreshing snapshot after missed events");
        if let Err(e) = self.refresh_snapshot().await {
            warn!(error = %e, "Snapshot refresh failed");
        }
    }
}
