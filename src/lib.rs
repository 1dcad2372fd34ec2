//! Vibewatch - clustering and proximity notifications for community safety reports.
//!
//! # Overview
//!
//! People submit short geotagged reports: a "vibe" sighting (calm, crowded,
//! dangerous, ...) or an emergency alert. Vibewatch groups nearby reports
//! into clusters with a dominant vibe, and tells each connected viewer about
//! new reports close to them, throttled by a cooldown window. Emergencies and
//! dangerous reports are also fanned out as push notifications.
//!
//! # Data Flow
//!
//! 1. A report is written to [`storage::Storage`], which publishes the change
//! 2. [`realtime::RealtimeSubscriptionManager`] receives it and hands it to the [`engine::Engine`]
//! 3. The engine runs it through each viewer's [`notify::NotificationDecider`]
//! 4. Emitted notifications land in the viewer's outbox; push-worthy ones go to [`push::PushDispatcher`]
//!
//! # Modules
//!
//! - [`model`]: Report, vote, and change-event types
//! - [`geo`]: Haversine distance and radius filtering
//! - [`vibe`]: Dominant-vibe analysis
//! - [`cluster`]: Seed-based geographic and textual clustering
//! - [`notify`]: Cooldown, severity, and per-viewer notification decisions
//! - [`aggregation`]: Area summaries and local sentiment
//! - [`push`]: Push fan-out
//! - [`geocoder`]: Place name lookup
//! - [`store`]: Report store contract and change feed
//! - [`storage`]: SQLite storage layer
//! - [`realtime`]: Change-feed subscriptions with reconnect backoff
//! - [`engine`]: Viewer registry, report snapshot, and event routing
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment configuration

pub mod aggregation;
pub mod api;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod geocoder;
pub mod model;
pub mod notify;
pub mod push;
pub mod realtime;
pub mod storage;
pub mod store;
pub mod vibe;
