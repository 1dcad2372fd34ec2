//! HTTP API handlers for Vibewatch.
//!
//! The handlers are a thin layer over [`Storage`] (writes) and [`Engine`]
//! (reads and viewer registration). Writes never notify directly; viewers
//! hear about a new report through the change feed like any other client.
//!
//! Input errors map to `400`, unknown reports or viewers to `404`, and
//! storage or collaborator failures to `500`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::aggregation::LocalSentiment;
use crate::cluster::Cluster;
use crate::engine::Engine;
use crate::model::{
    ClustersQuery, Coordinates, CreateReportRequest, Report, SentimentQuery, UpdateReportRequest,
    ViewerLocationRequest, VoteCounts, VoteRequest,
};
use crate::notify::Notification;
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub engine: Arc<Engine>,
}

/// All routes, without middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/reports", post(post_report))
        .route("/reports/:id", put(put_report).delete(delete_report))
        .route("/reports/:id/votes", post(post_vote))
        .route("/clusters", get(get_clusters))
        .route("/sentiment", get(get_sentiment))
        .route("/viewers/:id", put(put_viewer).delete(delete_viewer))
        .route("/viewers/:id/notifications", get(get_notifications))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /reports - Submit a report.
///
/// # Request Body
///
/// ```json
/// {
///     "author_id": "user-17",
///     "latitude": 30.0444,
///     "longitude": 31.2357,
///     "location_name": "Tahrir",
///     "category": "crowded"
/// }
/// ```
///
/// Set `"emergency": true` instead of `category` for an SOS report.
/// Coordinates are optional; a report without them needs a location name
/// to ever be clustered.
///
/// # Response
///
/// `201 Created` with the stored report.
#[instrument(skip(state, request))]
pub async fn post_report(
    State(state): State<AppState>,
    Json(request): Json<CreateReportRequest>,
) -> Result<(StatusCode, Json<Report>), StatusCode> {
    let new_report = request.into_new_report(Utc::now()).map_err(|e| {
        warn!(error = %e, "Rejected report");
        StatusCode::BAD_REQUEST
    })?;

    match state.storage.insert_report(&new_report).await {
        Ok(report) => {
            info!(
                report_id = report.id,
                vibe = report.vibe_label(),
                locatable = report.is_locatable(),
                "Report recorded"
            );
            Ok((StatusCode::CREATED, Json(report)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to record report");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /reports/:id - Correct a report's location or kind.
///
/// Takes the same body as POST /reports minus `author_id`. The change is
/// routed like an insert, but a viewer already notified about this report
/// is not notified again.
///
/// # Response
///
/// The updated report, or `404 Not Found`.
#[instrument(skip(state, request))]
pub async fn put_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateReportRequest>,
) -> Result<Json<Report>, StatusCode> {
    let (coordinates, location_name, kind) = request.into_parts().map_err(|e| {
        warn!(report_id = id, error = %e, "Rejected report update");
        StatusCode::BAD_REQUEST
    })?;

    match state
        .storage
        .update_report(id, coordinates, location_name, kind)
        .await
    {
        Ok(Some(report)) => {
            info!(report_id = id, vibe = report.vibe_label(), "Report updated");
            Ok(Json(report))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(report_id = id, error = %e, "Failed to update report");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /reports/:id - Remove a report and its votes.
#[instrument(skip(state))]
pub async fn delete_report(State(state): State<AppState>, Path(id): Path<i64>) -> StatusCode {
    match state.storage.delete_report(id).await {
        Ok(true) => {
            info!(report_id = id, "Report deleted");
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!(report_id = id, error = %e, "Failed to delete report");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// POST /reports/:id/votes - Vote a report up or down.
///
/// A user has at most one vote per report; voting again replaces it.
///
/// # Request Body
///
/// ```json
/// { "user_id": "user-4", "vote": "up" }
/// ```
///
/// # Response
///
/// The report's updated tallies.
#[instrument(skip(state, request))]
pub async fn post_vote(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<VoteCounts>, StatusCode> {
    match state
        .storage
        .cast_vote(id, &request.user_id, request.vote)
        .await
    {
        Ok(Some(counts)) => {
            info!(
                report_id = id,
                upvotes = counts.upvotes,
                downvotes = counts.downvotes,
                vote = request.vote.as_str(),
                "Vote recorded"
            );
            Ok(Json(counts))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(report_id = id, error = %e, "Failed to record vote");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /clusters - Cluster recent reports.
///
/// # Query Parameters
///
/// - `lat`, `lon` (optional): Caller location. Without it, clusters are not
///   ordered by distance and reports without coordinates are left out.
/// - `max_distance_km` (optional): Seed radius (default: configured cluster distance)
#[instrument(skip(state))]
pub async fn get_clusters(
    State(state): State<AppState>,
    Query(query): Query<ClustersQuery>,
) -> Result<Json<Vec<Cluster>>, StatusCode> {
    let user_location = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => Some(Coordinates::checked(lat, lon).map_err(|e| {
            warn!(error = %e, "Invalid caller location");
            StatusCode::BAD_REQUEST
        })?),
        _ => None,
    };

    let clusters = state
        .engine
        .clusters(user_location, query.max_distance_km, Utc::now())
        .map_err(|e| {
            warn!(error = %e, "Invalid cluster query");
            StatusCode::BAD_REQUEST
        })?;

    info!(cluster_count = clusters.len(), "Clusters queried");
    Ok(Json(clusters))
}

/// GET /sentiment - Vibe breakdown around a point.
///
/// # Query Parameters
///
/// - `lat`, `lon` (required): Center
/// - `radius_km` (optional): Radius (default: configured notification radius)
///
/// # Response
///
/// ```json
/// {
///     "center": { "latitude": 30.04, "longitude": 31.23 },
///     "radius_km": 5.0,
///     "report_count": 12,
///     "summary": {
///         "dominant_vibe": { "category": "lively", "count": 7, "percentage": 58 },
///         "top_vibes": [],
///         "total": 12
///     },
///     "area_label": "Downtown"
/// }
/// ```
#[instrument(skip(state))]
pub async fn get_sentiment(
    State(state): State<AppState>,
    Query(query): Query<SentimentQuery>,
) -> Result<Json<LocalSentiment>, StatusCode> {
    let center = Coordinates::checked(query.lat, query.lon).map_err(|e| {
        warn!(error = %e, "Invalid sentiment center");
        StatusCode::BAD_REQUEST
    })?;

    let sentiment = state
        .engine
        .local_sentiment(center, query.radius_km)
        .await
        .map_err(|e| {
            warn!(error = %e, "Invalid sentiment query");
            StatusCode::BAD_REQUEST
        })?;

    info!(
        report_count = sentiment.report_count,
        dominant = %sentiment.summary.dominant_vibe.category,
        "Sentiment queried"
    );
    Ok(Json(sentiment))
}

/// Body returned by PUT /viewers/:id.
#[derive(Debug, Serialize)]
pub struct ViewerResponse {
    pub viewer_id: String,
    pub location: Option<Coordinates>,
}

/// PUT /viewers/:id - Register a viewer or update its location.
///
/// # Request Body
///
/// Coordinates:
///
/// ```json
/// { "latitude": 30.04, "longitude": 31.23 }
/// ```
///
/// or a place name resolved through the geocoder:
///
/// ```json
/// { "place": "Zamalek, Cairo" }
/// ```
///
/// An empty body registers the viewer without a location; it will not
/// receive proximity notifications until one is set.
///
/// # Response
///
/// `201 Created` for a new viewer, `200 OK` for an update.
#[instrument(skip(state, request))]
pub async fn put_viewer(
    State(state): State<AppState>,
    Path(viewer_id): Path<String>,
    Json(request): Json<ViewerLocationRequest>,
) -> Result<(StatusCode, Json<ViewerResponse>), StatusCode> {
    let location = match (request.latitude, request.longitude, request.place.as_deref()) {
        (Some(lat), Some(lon), _) => Some(Coordinates::checked(lat, lon).map_err(|e| {
            warn!(viewer = %viewer_id, error = %e, "Invalid viewer location");
            StatusCode::BAD_REQUEST
        })?),
        (_, _, Some(place)) => match state.engine.resolve_place(place).await {
            Ok(Some(at)) => Some(at),
            Ok(None) => {
                warn!(viewer = %viewer_id, place, "Could not resolve place");
                return Err(StatusCode::BAD_REQUEST);
            }
            Err(e) => {
                warn!(viewer = %viewer_id, error = %e, "Geocoding failed");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        _ => None,
    };

    let created = state.engine.register_viewer(&viewer_id, location);
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(ViewerResponse { viewer_id, location })))
}

/// DELETE /viewers/:id - Stop routing notifications to a viewer.
#[instrument(skip(state))]
pub async fn delete_viewer(
    State(state): State<AppState>,
    Path(viewer_id): Path<String>,
) -> StatusCode {
    if state.engine.unregister_viewer(&viewer_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// GET /viewers/:id/notifications - Recent notifications, newest first.
#[instrument(skip(state))]
pub async fn get_notifications(
    State(state): State<AppState>,
    Path(viewer_id): Path<String>,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    state
        .engine
        .notifications(&viewer_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
