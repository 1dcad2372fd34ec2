//! Vibewatch server.
//!
//! # API Endpoints
//!
//! - `POST /reports` - Submit a report
//! - `PUT /reports/:id` - Correct a report's location or kind
//! - `DELETE /reports/:id` - Remove a report
//! - `POST /reports/:id/votes` - Vote on a report
//! - `GET /clusters` - Cluster recent reports
//! - `GET /sentiment` - Vibe breakdown around a point
//! - `PUT /viewers/:id` - Register a viewer or update its location
//! - `DELETE /viewers/:id` - Unregister a viewer
//! - `GET /viewers/:id/notifications` - Recent notifications for a viewer
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vibewatch::api::{AppState, router};
use vibewatch::config::EngineConfig;
use vibewatch::engine::Engine;
use vibewatch::geocoder::NominatimClient;
use vibewatch::push::{HttpPushTransport, PushDispatcher};
use vibewatch::realtime::RealtimeSubscriptionManager;
use vibewatch::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("vibewatch=info".parse()?))
        .init();

    let config = EngineConfig::from_env()?;

    info!(
        port = config.port,
        db_url = %config.database_url,
        radius_km = config.notification_radius_km,
        cooldown_secs = config.cooldown.num_seconds(),
        "Starting Vibewatch server"
    );

    // Initialize storage
    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let mut engine = Engine::new(config.clone(), Arc::new(storage.clone()))?;

    match &config.push_url {
        Some(url) => {
            let transport = HttpPushTransport::new(url, config.push_api_key.clone());
            engine = engine.with_push(PushDispatcher::new(
                Arc::new(transport),
                config.push_radius_km,
            )?);
            info!(push_url = %url, "Push fan-out enabled");
        }
        None => info!("Push fan-out disabled (VIBEWATCH_PUSH_URL not set)"),
    }

    match &config.geocoder_url {
        Some(url) => {
            engine = engine.with_geocoder(Arc::new(NominatimClient::new(url)?));
            info!(geocoder_url = %url, "Geocoding enabled");
        }
        None => info!("Geocoding disabled (VIBEWATCH_GEOCODER_URL not set)"),
    }

    let engine = Arc::new(engine);
    let seeded = engine.refresh_snapshot().await?;
    info!(reports = seeded, "Snapshot seeded");

    // Realtime routing
    let subscriptions = RealtimeSubscriptionManager::new(
        Arc::new(storage.clone()),
        engine.clone(),
        config.backoff,
        config.subscribe_timeout,
    )
    .start();

    let shutdown = CancellationToken::new();
    let snapshot_task = spawn_snapshot_refresh(engine.clone(), config.snapshot_refresh, shutdown.clone());
    let summary_task = spawn_area_summaries(engine.clone(), config.summary_interval, shutdown.clone());

    let state = AppState {
        storage,
        engine,
    };

    let app = router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Vibewatch is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("Shutting down");
    subscriptions.unsubscribe();
    shutdown.cancel();
    subscriptions.join().await;
    let _ = tokio::join!(snapshot_task, summary_task);

    Ok(())
}

fn spawn_snapshot_refresh(
    engine: Arc<Engine>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately and the snapshot was just seeded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = engine.refresh_snapshot().await {
                warn!(error = %e, "Periodic snapshot refresh failed");
            }
        }
    })
}

fn spawn_area_summaries(
    engine: Arc<Engine>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let delivered = engine.run_area_summaries(Utc::now()).await;
            info!(delivered, "Area summaries sent");
        }
    })
}
