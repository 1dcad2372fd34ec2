//! End-to-end flow: HTTP write -> change feed -> subscription manager ->
//! engine -> viewer notification.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::json;
use tokio::sync::broadcast;

use vibewatch::api::{AppState, router};
use vibewatch::config::EngineConfig;
use vibewatch::engine::{Engine, ViewerNotification};
use vibewatch::notify::NotificationSeverity;
use vibewatch::realtime::{BackoffPolicy, RealtimeSubscriptionManager, SubscriptionHandle};
use vibewatch::storage::Storage;

struct Harness {
    server: TestServer,
    state: AppState,
    subscriptions: SubscriptionHandle,
}

async fn start() -> Harness {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let config = EngineConfig {
        route_delay: Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(config, Arc::new(storage.clone())).unwrap());

    let subscriptions = RealtimeSubscriptionManager::new(
        Arc::new(storage.clone()),
        engine.clone(),
        BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 2.0).unwrap(),
        Duration::from_secs(1),
    )
    .start();

    // Both collection tasks must be attached before anything is written
    tokio::time::timeout(Duration::from_secs(2), async {
        while storage.feed().subscriber_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriptions never attached");

    let state = AppState { storage, engine };
    let server = TestServer::new(router(state.clone())).unwrap();

    Harness {
        server,
        state,
        subscriptions,
    }
}

async fn next_notification(rx: &mut broadcast::Receiver<ViewerNotification>) -> ViewerNotification {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no notification arrived")
        .expect("notification channel closed")
}

#[tokio::test]
async fn test_nearby_emergency_reaches_viewer() {
    let h = start().await;
    let mut live = h.state.engine.subscribe_notifications();

    h.server
        .put("/viewers/near")
        .json(&json!({"latitude": 30.0, "longitude": 31.0}))
        .await
        .assert_status(axum::http::StatusCode::CREATED);
    h.server
        .put("/viewers/far")
        .json(&json!({"latitude": 31.0, "longitude": 31.0}))
        .await
        .assert_status(axum::http::StatusCode::CREATED);

    h.server
        .post("/reports")
        .json(&json!({
            "author_id": "reporter",
            "latitude": 30.02,
            "longitude": 31.0,
            "location_name": "Corniche",
            "emergency": true
        }))
        .await
        .assert_status(axum::http::StatusCode::CREATED);

    let delivered = next_notification(&mut live).await;
    assert_eq!(delivered.viewer_id, "near");
    assert_eq!(delivered.notification.severity, NotificationSeverity::Emergency);
    assert!(delivered.notification.should_push);
    assert!(delivered.notification.message.contains("near Corniche"));

    let outbox: serde_json::Value = h.server.get("/viewers/near/notifications").await.json();
    assert_eq!(outbox.as_array().unwrap().len(), 1);
    assert_eq!(outbox[0]["severity"], "emergency");
    assert_eq!(outbox[0]["distance_km"], 2.2);

    let far: serde_json::Value = h.server.get("/viewers/far/notifications").await.json();
    assert_eq!(far, json!([]));

    // Snapshot followed the insert without a refresh
    assert_eq!(h.state.engine.snapshot().len(), 1);

    h.subscriptions.unsubscribe();
    h.subscriptions.join().await;
}

#[tokio::test]
async fn test_cooldown_throttles_second_report() {
    let h = start().await;
    let mut live = h.state.engine.subscribe_notifications();
    h.state.engine.register_viewer("near", Some(vibewatch::model::Coordinates::new(30.0, 31.0)));

    for category in ["dangerous", "noisy"] {
        h.server
            .post("/reports")
            .json(&json!({
                "author_id": "reporter",
                "latitude": 30.01,
                "longitude": 31.0,
                "category": category
            }))
            .await
            .assert_status(axum::http::StatusCode::CREATED);
    }

    let first = next_notification(&mut live).await;
    assert_eq!(first.notification.severity, NotificationSeverity::Critical);

    // Give the second change time to be routed, then check it was throttled
    let second = tokio::time::timeout(Duration::from_millis(200), live.recv()).await;
    assert!(second.is_err(), "second report should be inside the cooldown");

    let outbox = h.state.engine.notifications("near").unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(h.state.engine.snapshot().len(), 2);

    h.subscriptions.unsubscribe();
    h.subscriptions.join().await;
}

#[tokio::test]
async fn test_votes_and_deletes_do_not_notify() {
    let h = start().await;
    let storage = &h.state.storage;

    let created: serde_json::Value = h
        .server
        .post("/reports")
        .json(&json!({
            "author_id": "reporter",
            "latitude": 30.01,
            "longitude": 31.0,
            "category": "calm"
        }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    // Registered after the insert, so only later changes could reach it
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.state.engine.snapshot().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.state.engine.register_viewer("late", Some(vibewatch::model::Coordinates::new(30.0, 31.0)));
    let mut live = h.state.engine.subscribe_notifications();

    h.server
        .post(&format!("/reports/{id}/votes"))
        .json(&json!({"user_id": "u1", "vote": "up"}))
        .await
        .assert_status_ok();

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.state.engine.snapshot()[0].votes.upvotes != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("vote counts never refreshed");

    assert!(storage.delete_report(id).await.unwrap());
    tokio::time::timeout(Duration::from_secs(2), async {
        while !h.state.engine.snapshot().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("delete never reached the snapshot");

    assert!(live.try_recv().is_err());
    assert!(h.state.engine.notifications("late").unwrap().is_empty());

    h.subscriptions.unsubscribe();
    h.subscriptions.join().await;
}

#[tokio::test]
async fn test_update_into_range_notifies() {
    let h = start().await;
    let mut live = h.state.engine.subscribe_notifications();
    h.state.engine.register_viewer("near", Some(vibewatch::model::Coordinates::new(30.0, 31.0)));

    let created: serde_json::Value = h
        .server
        .post("/reports")
        .json(&json!({
            "author_id": "reporter",
            "latitude": 31.0,
            "longitude": 31.0,
            "category": "calm"
        }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    h.server
        .put(&format!("/reports/{id}"))
        .json(&json!({
            "latitude": 30.01,
            "longitude": 31.0,
            "emergency": true
        }))
        .await
        .assert_status_ok();

    // The original insert was out of range, so the first delivery is the update
    let delivered = next_notification(&mut live).await;
    assert_eq!(delivered.viewer_id, "near");
    assert_eq!(delivered.notification.report_id, Some(id));
    assert_eq!(delivered.notification.severity, NotificationSeverity::Emergency);

    let snapshot = h.state.engine.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].is_emergency());

    h.subscriptions.unsubscribe();
    h.subscriptions.join().await;
}
