use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::book::BookState;
use crate::client::SyncStatus;
use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use crate::store::BookStore;
use crate::types::{AssetId, ConnectionState};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub feed: String,
    #[serde(flatten)]
    pub sync: SyncStatus,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub feed_name: String,
    pub state: watch::Receiver<ConnectionState>,
    pub registry: Arc<SubscriptionRegistry>,
    pub store: Arc<BookStore>,
    pub metrics: Arc<SyncMetrics>,
    pub stale_after: Duration,
}

impl ServerState {
    fn status(&self) -> SyncStatus {
        SyncStatus::collect(
            *self.state.borrow(),
            &self.registry,
            &self.store,
            self.stale_after,
        )
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        feed: state.feed_name.clone(),
        sync: state.status(),
    })
}

/// Ready endpoint - returns 200 only while the session is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let sync = state.status();
    let connected = sync.state == ConnectionState::Connected;
    let status_code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if connected { "ready" } else { "not_ready" }.to_string(),
            feed: state.feed_name.clone(),
            sync,
        }),
    )
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}

/// Current ladder for one asset
async fn book(
    State(state): State<ServerState>,
    Path(asset): Path<String>,
) -> Result<Json<BookState>, StatusCode> {
    state
        .store
        .get(&AssetId::from(asset))
        .map(|book| Json(BookState::clone(&book)))
        .map_err(|_| StatusCode::NOT_FOUND)
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/books/:asset", get(book))
        .with_state(state)
}

/// Run the health server
pub async fn run_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
