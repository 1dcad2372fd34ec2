//! SQLite storage layer for Vibewatch.
//!
//! Implements [`ReportStore`] on top of two tables:
//!
//! - `reports`: one row per submission; coordinates and location name are nullable
//! - `votes`: one row per (report, user), holding the latest vote direction
//!
//! Every successful mutation is published on the in-process [`ChangeFeed`],
//! which is what realtime subscriptions observe.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::model::{
    ChangeEvent, ChangeKind, Collection, Coordinates, NewReport, Report, ReportChange,
    ReportKind, VoteChange, VoteCounts, VoteType,
};
use crate::store::{ChangeFeed, ChangeStream, ReportQuery, ReportStore};

/// Report columns plus aggregated vote tallies. Callers append filters
/// after the `WHERE 1 = 1` and must finish with `GROUP BY r.id`.
const REPORT_SELECT: &str = r#"
    SELECT r.id, r.latitude, r.longitude, r.location_name, r.author_id,
           r.emergency, r.category, r.created_at,
           COALESCE(SUM(CASE WHEN v.vote = 'up' THEN 1 ELSE 0 END), 0) AS upvotes,
           COALESCE(SUM(CASE WHEN v.vote = 'down' THEN 1 ELSE 0 END), 0) AS downvotes
    FROM reports r
    LEFT JOIN votes v ON v.report_id = r.id
    WHERE 1 = 1
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:vibewatch.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // An in-memory database lives and dies with its connection, so keep
        // exactly one and never recycle it.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;

        let storage = Self {
            pool,
            feed: ChangeFeed::default(),
        };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// The feed this store publishes mutations on.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                latitude REAL,
                longitude REAL,
                location_name TEXT,
                author_id TEXT NOT NULL,
                emergency INTEGER NOT NULL,
                category TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                report_id INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                vote TEXT NOT NULL,
                PRIMARY KEY (report_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Recency scans and coarse bounding-box filters
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reports_created_at
            ON reports(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reports_lat_lon
            ON reports(latitude, longitude)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new report and publish an `insert` change.
    pub async fn insert_report(&self, new: &NewReport) -> anyhow::Result<Report> {
        let (emergency, category) = kind_columns(&new.kind);

        let result = sqlx::query(
            r#"
            INSERT INTO reports
                (latitude, longitude, location_name, author_id, emergency, category, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.coordinates.map(|c| c.latitude))
        .bind(new.coordinates.map(|c| c.longitude))
        .bind(&new.location_name)
        .bind(&new.author_id)
        .bind(emergency)
        .bind(category)
        .bind(new.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let report = Report {
            id: result.last_insert_rowid(),
            coordinates: new.coordinates,
            location_name: new.location_name.clone(),
            author_id: new.author_id.clone(),
            created_at: new.created_at,
            votes: VoteCounts::default(),
            kind: new.kind,
        };

        self.feed.publish(ChangeEvent::Report(ReportChange {
            kind: ChangeKind::Insert,
            new: Some(report.clone()),
            old: None,
            committed_at: Utc::now(),
        }));

        Ok(report)
    }

    /// Replace a report's location and kind. Returns the updated report, or
    /// `None` if no report has that id.
    pub async fn update_report(
        &self,
        id: i64,
        coordinates: Option<Coordinates>,
        location_name: Option<String>,
        kind: ReportKind,
    ) -> anyhow::Result<Option<Report>> {
        let Some(old) = self.get_report(id).await? else {
            return Ok(None);
        };
        let (emergency, category) = kind_columns(&kind);

        sqlx::query(
            r#"
            UPDATE reports
            SET latitude = ?, longitude = ?, location_name = ?, emergency = ?, category = ?
            WHERE id = ?
            "#,
        )
        .bind(coordinates.map(|c| c.latitude))
        .bind(coordinates.map(|c| c.longitude))
        .bind(&location_name)
        .bind(emergency)
        .bind(category)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let new = Report {
            coordinates,
            location_name,
            kind,
            ..old.clone()
        };

        self.feed.publish(ChangeEvent::Report(ReportChange {
            kind: ChangeKind::Update,
            new: Some(new.clone()),
            old: Some(old),
            committed_at: Utc::now(),
        }));

        Ok(Some(new))
    }

    /// Delete a report and its votes. Returns `false` if it did not exist.
    pub async fn delete_report(&self, id: i64) -> anyhow::Result<bool> {
        let Some(old) = self.get_report(id).await? else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM votes WHERE report_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM reports WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.feed.publish(ChangeEvent::Report(ReportChange {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            committed_at: Utc::now(),
        }));

        Ok(true)
    }

    /// Record a user's vote, replacing any earlier vote by the same user.
    ///
    /// Returns the new tallies, or `None` if the report does not exist.
    pub async fn cast_vote(
        &self,
        report_id: i64,
        user_id: &str,
        vote: VoteType,
    ) -> anyhow::Result<Option<VoteCounts>> {
        if self.get_report(report_id).await?.is_none() {
            return Ok(None);
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT vote FROM votes WHERE report_id = ? AND user_id = ?")
                .bind(report_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO votes (report_id, user_id, vote)
            VALUES (?, ?, ?)
            ON CONFLICT(report_id, user_id) DO UPDATE SET vote = excluded.vote
            "#,
        )
        .bind(report_id)
        .bind(user_id)
        .bind(vote.as_str())
        .execute(&self.pool)
        .await?;

        let kind = if existing.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.feed
            .publish(ChangeEvent::Vote(VoteChange { kind, report_id }));

        self.vote_counts(report_id).await
    }

    /// Fetch a single report with its current vote tallies.
    pub async fn get_report(&self, id: i64) -> anyhow::Result<Option<Report>> {
        let mut qb = QueryBuilder::<Sqlite>::new(REPORT_SELECT);
        qb.push(" AND r.id = ").push_bind(id).push(" GROUP BY r.id");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_report).transpose()
    }

    /// Query reports, newest first.
    pub async fn query_reports(&self, query: &ReportQuery) -> anyhow::Result<Vec<Report>> {
        let mut qb = QueryBuilder::<Sqlite>::new(REPORT_SELECT);

        if let Some(since) = query.since {
            qb.push(" AND r.created_at >= ")
                .push_bind(since.timestamp_millis());
        }
        if let Some(bounds) = query.bounds {
            qb.push(" AND r.latitude BETWEEN ")
                .push_bind(bounds.min_latitude)
                .push(" AND ")
                .push_bind(bounds.max_latitude)
                .push(" AND r.longitude BETWEEN ")
                .push_bind(bounds.min_longitude)
                .push(" AND ")
                .push_bind(bounds.max_longitude);
        }
        if query.emergency_only {
            qb.push(" AND r.emergency = 1");
        }

        qb.push(" GROUP BY r.id ORDER BY r.created_at DESC, r.id DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_report).collect()
    }
}

#[async_trait]
impl ReportStore for Storage {
    async fn query(&self, query: &ReportQuery) -> anyhow::Result<Vec<Report>> {
        self.query_reports(query).await
    }

    async fn vote_counts(&self, report_id: i64) -> anyhow::Result<Option<VoteCounts>> {
        Ok(self.get_report(report_id).await?.map(|r| r.votes))
    }

    async fn subscribe(&self, collection: Collection) -> anyhow::Result<ChangeStream> {
        Ok(self.feed.subscribe(collection))
    }
}

fn kind_columns(kind: &ReportKind) -> (bool, Option<&'static str>) {
    match kind {
        ReportKind::Emergency => (true, None),
        ReportKind::Vibe { category } => (false, Some(category.as_str())),
    }
}

fn row_to_report(row: &SqliteRow) -> anyhow::Result<Report> {
    let id: i64 = row.get("id");
    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");
    let emergency: i64 = row.get("emergency");
    let category: Option<String> = row.get("category");
    let created_at_ms: i64 = row.get("created_at");

    let kind = if emergency != 0 {
        ReportKind::Emergency
    } else {
        let category = category.with_context(|| format!("report {id} has no category"))?;
        ReportKind::Vibe {
            category: category.parse()?,
        }
    };

    let created_at: DateTime<Utc> = DateTime::from_timestamp_millis(created_at_ms)
        .with_context(|| format!("report {id} has invalid created_at {created_at_ms}"))?;

    Ok(Report {
        id,
        coordinates: latitude
            .zip(longitude)
            .map(|(lat, lon)| Coordinates::new(lat, lon)),
        location_name: row.get("location_name"),
        author_id: row.get("author_id"),
        created_at,
        votes: VoteCounts {
            upvotes: row.get("upvotes"),
            downvotes: row.get("downvotes"),
        },
        kind,
    })
}
