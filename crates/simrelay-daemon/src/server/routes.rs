use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_stream::Stream;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use simrelay_core::config::{Target, TargetList};

use crate::hub::BroadcastHub;
use crate::supervisor::{Ack, Supervisor};

use super::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub hub: Arc<BroadcastHub>,
    pub targets: Arc<TargetList>,
}

/// Body of `POST /api/start-simulation`.
///
/// `bearingName` and `basePath` are accepted for older clients;
/// `basePath` becomes the `base_path` parameter.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default, alias = "bearingName")]
    pub target: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, alias = "basePath")]
    pub base_path: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/events", get(events))
        .route("/start-simulation", post(start_simulation))
        .route(
            "/stop-simulation",
            get(stop_simulation).post(stop_simulation),
        )
        .route("/bearings", get(targets));

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /api/events`: one SSE frame per event until the client leaves.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut subscription = state.hub.register().await;

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            match SseEvent::default().json_data(&event) {
                Ok(frame) => yield Ok::<_, Infallible>(frame),
                Err(e) => warn!(kind = event.kind(), error = %e, "Failed to encode event"),
            }
        }
        debug!(subscriber_id = %subscription.id(), "Event stream closed by hub");
    };

    Sse::new(stream)
}

/// `POST /api/start-simulation`
///
/// A body that is missing or not JSON is a bad request like any other.
pub async fn start_simulation(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(req) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let Some(target) = req.target.filter(|t| !t.trim().is_empty()) else {
        return Err(ApiError::BadRequest(
            "target (bearingName) is required".to_string(),
        ));
    };

    let mut parameters = req.parameters;
    if let Some(base_path) = req.base_path {
        parameters.insert("base_path".to_string(), base_path);
    }

    let ack = state.supervisor.start(&target, parameters).await?;
    Ok(Json(ack))
}

/// `GET|POST /api/stop-simulation`
pub async fn stop_simulation(State(state): State<AppState>) -> Json<Ack> {
    Json(state.supervisor.stop().await)
}

/// `GET /api/bearings`: the configured selectable targets.
pub async fn targets(State(state): State<AppState>) -> Json<Vec<Target>> {
    Json(state.targets.0.clone())
}
