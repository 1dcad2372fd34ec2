//! Integration tests for Vibewatch API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use serde_json::json;
use tower::ServiceExt;

use vibewatch::api::{AppState, router};
use vibewatch::config::EngineConfig;
use vibewatch::engine::Engine;
use vibewatch::storage::Storage;

async fn create_state() -> AppState {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let config = EngineConfig {
        route_delay: Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(config, Arc::new(storage.clone())).unwrap());

    AppState { storage, engine }
}

async fn create_test_server() -> (TestServer, AppState) {
    let state = create_state().await;
    let server = TestServer::new(router(state.clone())).unwrap();
    (server, state)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _) = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_health_endpoint_oneshot() {
    let app = router(create_state().await);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_post_vibe_report() {
    let (server, _) = create_test_server().await;

    let response = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "latitude": 30.0444,
            "longitude": 31.2357,
            "location_name": "Tahrir",
            "category": "Crowded"
        }))
        .await;

    response.assert_status(StatusCode::CREATED);

    let body: serde_json::Value = response.json();
    assert_eq!(body["kind"], "vibe");
    assert_eq!(body["category"], "crowded");
    assert_eq!(body["location_name"], "Tahrir");
    assert_eq!(body["votes"]["upvotes"], 0);
}

#[tokio::test]
async fn test_post_emergency_report_without_coordinates() {
    let (server, _) = create_test_server().await;

    let response = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "location_name": "Ramses Station",
            "emergency": true
        }))
        .await;

    response.assert_status(StatusCode::CREATED);

    let body: serde_json::Value = response.json();
    assert_eq!(body["kind"], "emergency");
    assert!(body["coordinates"].is_null());
}

#[tokio::test]
async fn test_post_report_rejects_unknown_category() {
    let (server, _) = create_test_server().await;

    let response = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "latitude": 30.0,
            "longitude": 31.0,
            "category": "spooky"
        }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_post_report_rejects_bad_coordinates() {
    let (server, _) = create_test_server().await;

    let response = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "latitude": 130.0,
            "longitude": 31.0,
            "emergency": true
        }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_vote_and_delete_report() {
    let (server, _) = create_test_server().await;

    let created: serde_json::Value = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "latitude": 30.0,
            "longitude": 31.0,
            "category": "calm"
        }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    server
        .post(&format!("/reports/{id}/votes"))
        .json(&json!({"user_id": "u1", "vote": "up"}))
        .await
        .assert_status_ok();

    // Changing a vote replaces it
    let response = server
        .post(&format!("/reports/{id}/votes"))
        .json(&json!({"user_id": "u1", "vote": "down"}))
        .await;
    response.assert_status_ok();
    let counts: serde_json::Value = response.json();
    assert_eq!(counts["upvotes"], 0);
    assert_eq!(counts["downvotes"], 1);

    server
        .delete(&format!("/reports/{id}"))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .delete(&format!("/reports/{id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .post(&format!("/reports/{id}/votes"))
        .json(&json!({"user_id": "u1", "vote": "up"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_clusters_from_snapshot() {
    let (server, state) = create_test_server().await;

    for category in ["lively", "lively", "noisy"] {
        server
            .post("/reports")
            .json(&json!({
                "author_id": "user-1",
                "latitude": 30.001,
                "longitude": 31.0,
                "location_name": "Downtown",
                "category": category
            }))
            .await
            .assert_status(StatusCode::CREATED);
    }
    state.engine.refresh_snapshot().await.unwrap();

    let response = server.get("/clusters?lat=30.0&lon=31.0").await;
    response.assert_status_ok();

    let clusters: serde_json::Value = response.json();
    let clusters = clusters.as_array().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0]["origin"], "geo");
    assert_eq!(clusters[0]["location_name"], "Downtown");
    assert_eq!(clusters[0]["dominant_vibe"]["category"], "lively");
    assert_eq!(clusters[0]["dominant_vibe"]["percentage"], 67);
}

#[tokio::test]
async fn test_clusters_rejects_negative_distance() {
    let (server, _) = create_test_server().await;

    let response = server.get("/clusters?max_distance_km=-2").await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sentiment_empty_area() {
    let (server, _) = create_test_server().await;

    let response = server.get("/sentiment?lat=30.0&lon=31.0").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["report_count"], 0);
    assert_eq!(body["radius_km"], 5.0);
    assert_eq!(body["summary"]["dominant_vibe"]["category"], "unknown");
    assert!(body["area_label"].is_null());
}

#[tokio::test]
async fn test_viewer_lifecycle() {
    let (server, _) = create_test_server().await;

    let response = server
        .put("/viewers/viewer-1")
        .json(&json!({"latitude": 30.0, "longitude": 31.0}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["location"]["latitude"], 30.0);

    server
        .put("/viewers/viewer-1")
        .json(&json!({"latitude": 30.1, "longitude": 31.0}))
        .await
        .assert_status_ok();

    let notifications: serde_json::Value = server.get("/viewers/viewer-1/notifications").await.json();
    assert_eq!(notifications, json!([]));

    server
        .delete("/viewers/viewer-1")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .get("/viewers/viewer-1/notifications")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_viewer_place_without_geocoder() {
    let (server, _) = create_test_server().await;

    let response = server
        .put("/viewers/viewer-1")
        .json(&json!({"place": "Zamalek"}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_viewer_without_location() {
    let (server, state) = create_test_server().await;

    server
        .put("/viewers/viewer-1")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::CREATED);

    assert_eq!(state.engine.viewer_location("viewer-1"), Some(None));
}

#[tokio::test]
async fn test_update_report() {
    let (server, _) = create_test_server().await;

    let created: serde_json::Value = server
        .post("/reports")
        .json(&json!({
            "author_id": "user-1",
            "latitude": 30.0,
            "longitude": 31.0,
            "category": "calm"
        }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    let response = server
        .put(&format!("/reports/{id}"))
        .json(&json!({
            "latitude": 30.01,
            "longitude": 31.0,
            "location_name": "Garden City",
            "emergency": true
        }))
        .await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["kind"], "emergency");
    assert_eq!(body["author_id"], "user-1");
    assert_eq!(body["location_name"], "Garden City");

    server
        .put(&format!("/reports/{id}"))
        .json(&json!({"category": "spooky"}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .put("/reports/9999")
        .json(&json!({"emergency": true}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
