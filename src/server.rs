use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use parking_lot::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::poller::NeighborPoller;
use crate::types::DeviceSet;

#[derive(Clone)]
pub struct AppState {
    poller: NeighborPoller,
    latest: Arc<RwLock<Option<Arc<DeviceSet>>>>, // last published snapshot
}

impl AppState {
    /// Subscribe to `poller` so the API always serves the latest snapshot.
    pub fn attach(poller: &NeighborPoller) -> Self {
        let latest: Arc<RwLock<Option<Arc<DeviceSet>>>> = Arc::new(RwLock::new(None));
        let sink = latest.clone();
        poller.subscribe(move |set| {
            *sink.write() = Some(set);
        });
        Self {
            poller: poller.clone(),
            latest,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/devices", get(get_devices))
        .route("/status", get(get_status))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!(%bind, "serving device API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.poller.state()))
}

async fn get_devices(State(app): State<AppState>) -> impl IntoResponse {
    let latest = app.latest.read().clone();
    match latest {
        Some(set) => (StatusCode::OK, Json(set.as_ref().clone())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
