//! The report store contract and its change feed.
//!
//! The engine never talks to a database directly; it needs a store that can
//! answer time/geo-filtered queries and a live feed of mutations per
//! collection. [`crate::storage::Storage`] is the SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::geo::Bounds;
use crate::model::{ChangeEvent, Collection, Report, VoteCounts};

/// Default page size for store queries.
pub const DEFAULT_QUERY_LIMIT: u32 = 500;

/// Buffered events per collection before slow subscribers start lagging.
pub const FEED_CAPACITY: usize = 256;

/// Filters for [`ReportStore::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    /// Only reports created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only reports with coordinates inside this box.
    pub bounds: Option<Bounds>,
    pub emergency_only: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ReportQuery {
    fn default() -> Self {
        Self {
            since: None,
            bounds: None,
            emergency_only: false,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl ReportQuery {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn within(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

/// Failures surfaced by a [`ChangeStream`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The upstream feed is gone; the subscription must be re-established.
    #[error("change feed closed")]
    Closed,

    /// The subscriber fell behind and this many events were dropped.
    #[error("change feed lagged, {0} events dropped")]
    Lagged(u64),
}

/// A live subscription to one collection. Dropping it unsubscribes.
pub struct ChangeStream {
    collection: Collection,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeStream {
    pub fn new(collection: Collection, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { collection, rx }
    }

    /// Wait for the next event on this collection.
    pub async fn next(&mut self) -> Result<ChangeEvent, FeedError> {
        loop {
            match self.rx.recv().await {
                // The feed is shared; skip anything for other collections.
                Ok(event) if event.collection() != self.collection => continue,
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
            }
        }
    }
}

/// In-process broadcaster for store mutations.
///
/// Cheap to clone. Publishing with no subscribers drops the event.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, collection: Collection) -> ChangeStream {
        ChangeStream::new(collection, self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// What the engine needs from the report store.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Reports matching `query`, newest first.
    async fn query(&self, query: &ReportQuery) -> anyhow::Result<Vec<Report>>;

    /// Current tallies for a report, `None` if it no longer exists.
    async fn vote_counts(&self, report_id: i64) -> anyhow::Result<Option<VoteCounts>>;

    /// Open a live subscription to a collection.
    async fn subscribe(&self, collection: Collection) -> anyhow::Result<ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, VoteChange};

    fn vote_event(report_id: i64) -> ChangeEvent {
        ChangeEvent::Vote(VoteChange {
            kind: ChangeKind::Insert,
            report_id,
        })
    }

    #[tokio::test]
    async fn test_stream_filters_by_collection() {
        let feed = ChangeFeed::new(8);
        let mut reports = feed.subscribe(Collection::Reports);
        let mut votes = feed.subscribe(Collection::Votes);

        feed.publish(vote_event(3));
        drop(feed);

        assert_eq!(votes.next().await, Ok(vote_event(3)));
        assert_eq!(votes.next().await, Err(FeedError::Closed));
        assert_eq!(reports.next().await, Err(FeedError::Closed));
    }

    #[tokio::test]
    async fn test_stream_reports_lag() {
        let feed = ChangeFeed::new(2);
        let mut votes = feed.subscribe(Collection::Votes);

        for id in 0..5 {
            feed.publish(vote_event(id));
        }

        assert!(matches!(votes.next().await, Err(FeedError::Lagged(_))));
        assert_eq!(votes.next().await, Ok(vote_event(3)));
    }

    #[test]
    fn test_query_builders() {
        let since = Utc::now();
        let q = ReportQuery::since(since);
        assert_eq!(q.since, Some(since));
        assert_eq!(q.limit, DEFAULT_QUERY_LIMIT);
        assert!(q.bounds.is_none());
    }
}
