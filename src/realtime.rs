//! Live subscriptions to the report store's change feed.
//!
//! [`RealtimeSubscriptionManager`] runs one task per watched collection.
//! Each task opens a subscription (bounded by a timeout), forwards events to
//! a [`ChangeSink`] in arrival order, and reconnects with capped exponential
//! backoff whenever the subscription fails or closes. Everything stops when
//! the [`SubscriptionHandle`] is unsubscribed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::model::{ChangeEvent, Collection, ReportChange, VoteChange};
use crate::store::{FeedError, ReportStore};

/// Capped exponential delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// `initial` must be non-zero, `max` at least `initial`, and
    /// `multiplier` finite and >= 1.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self> {
        if initial.is_zero() {
            return Err(EngineError::InvalidBackoff(
                "initial delay must be positive".into(),
            ));
        }
        if max < initial {
            return Err(EngineError::InvalidBackoff(format!(
                "max delay {max:?} is below initial delay {initial:?}"
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(EngineError::InvalidBackoff(format!(
                "multiplier must be >= 1, got {multiplier}"
            )));
        }

        Ok(Self {
            initial,
            max,
            multiplier,
        })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Receiver of routed change events.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn on_report_change(&self, change: ReportChange);

    async fn on_vote_change(&self, change: VoteChange);

    /// Called when `missed` events on `collection` were dropped before delivery.
    async fn on_feed_lagged(&self, collection: Collection, missed: u64);
}

/// Owns the per-collection subscription tasks.
#[derive(Clone)]
pub struct RealtimeSubscriptionManager {
    store: Arc<dyn ReportStore>,
    sink: Arc<dyn ChangeSink>,
    policy: BackoffPolicy,
    subscribe_timeout: Duration,
}

impl RealtimeSubscriptionManager {
    pub fn new(
        store: Arc<dyn ReportStore>,
        sink: Arc<dyn ChangeSink>,
        policy: BackoffPolicy,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            policy,
            subscribe_timeout,
        }
    }

    /// Watch both the reports and votes collections.
    pub fn start(&self) -> SubscriptionHandle {
        self.start_collections(&[Collection::Reports, Collection::Votes])
    }

    /// Spawn one subscription task per collection.
    pub fn start_collections(&self, collections: &[Collection]) -> SubscriptionHandle {
        let cancel = CancellationToken::new();

        let tasks = collections
            .iter()
            .map(|&collection| {
                let manager = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.run(collection, cancel).await })
            })
            .collect();

        SubscriptionHandle { cancel, tasks }
    }

    async fn run(self, collection: Collection, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.subscribe_timeout, self.store.subscribe(collection)) => result,
            };

            match subscribed {
                Ok(Ok(mut stream)) => {
                    info!(%collection, "Subscribed to change feed");
                    attempt = 0;

                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(%collection, "Subscription cancelled");
                                return;
                            }
                            next = stream.next() => next,
                        };

                        match next {
                            Ok(event) => self.route(event).await,
                            Err(FeedError::Lagged(missed)) => {
                                warn!(%collection, missed, "Change feed lagged");
                                self.sink.on_feed_lagged(collection, missed).await;
                            }
                            Err(FeedError::Closed) => {
                                warn!(%collection, "Change feed closed");
                                break;
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(%collection, error = %e, "Failed to subscribe to change feed");
                }
                Err(_) => {
                    warn!(
                        %collection,
                        timeout_ms = self.subscribe_timeout.as_millis() as u64,
                        "Timed out subscribing to change feed"
                    );
                }
            }

            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                %collection,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnect scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(%collection, "Subscription task stopped");
    }

    async fn route(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Report(change) => self.sink.on_report_change(change).await,
            ChangeEvent::Vote(change) => self.sink.on_vote_change(change).await,
        }
    }
}

/// Handle to a running set of subscriptions.
///
/// Dropping the handle leaves the tasks running; call
/// [`SubscriptionHandle::unsubscribe`] to stop them.
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Stop every subscription task. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.cancel.is_cancelled() {
            info!("Unsubscribing from change feed");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscription task panicked");
            }
        }
    }
}
