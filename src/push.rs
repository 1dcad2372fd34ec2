//! Best-effort push fan-out for high-severity reports.
//!
//! The transport delivers to every device within a radius of the report;
//! the engine only asks once per report and never waits for the outcome.
//! Delivery failures are logged and dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, validate_radius};
use crate::model::Report;
use crate::notify::{Notification, NotificationSeverity, RecentIds, lock};

/// Default fan-out radius.
pub const DEFAULT_PUSH_RADIUS_KM: f64 = 5.0;

/// Reports remembered for at-most-once dispatch.
const DISPATCHED_MEMORY: usize = 1024;

/// Body sent to the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub report_id: i64,
    pub severity: NotificationSeverity,
    pub title: String,
    pub message: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

/// "Send push to devices near a point".
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_nearby(&self, request: &PushRequest) -> anyhow::Result<()>;
}

/// Push transport backed by an HTTP endpoint accepting [`PushRequest`] JSON.
#[derive(Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPushTransport {
    pub fn new(url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send_nearby(&self, request: &PushRequest) -> anyhow::Result<()> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        builder.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Fires push fan-out at most once per report.
pub struct PushDispatcher {
    transport: Arc<dyn PushTransport>,
    radius_km: f64,
    dispatched: Mutex<RecentIds>,
}

impl PushDispatcher {
    /// Fails on a negative or non-finite radius.
    pub fn new(transport: Arc<dyn PushTransport>, radius_km: f64) -> Result<Self> {
        Ok(Self {
            transport,
            radius_km: validate_radius(radius_km)?,
            dispatched: Mutex::new(RecentIds::new(DISPATCHED_MEMORY)),
        })
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    /// Spawn a detached fan-out for `report`.
    ///
    /// Returns `None` without spawning when the report was already
    /// dispatched or has no coordinates to fan out from.
    pub fn dispatch(&self, report: &Report, notification: &Notification) -> Option<JoinHandle<()>> {
        let Some(center) = report.coordinates else {
            debug!(report_id = report.id, "Push skipped: report has no coordinates");
            return None;
        };

        if !lock(&self.dispatched).insert(report.id) {
            debug!(report_id = report.id, "Push already dispatched");
            return None;
        }

        let request = PushRequest {
            report_id: report.id,
            severity: notification.severity,
            title: notification.title.clone(),
            message: notification.message.clone(),
            latitude: center.latitude,
            longitude: center.longitude,
            radius_km: self.radius_km,
        };
        let transport = Arc::clone(&self.transport);

        Some(tokio::spawn(async move {
            match transport.send_nearby(&request).await {
                Ok(()) => info!(
                    report_id = request.report_id,
                    radius_km = request.radius_km,
                    "Push fan-out sent"
                ),
                Err(e) => warn!(
                    report_id = request.report_id,
                    error = %e,
                    "Push fan-out failed"
                ),
            }
        }))
    }
}
