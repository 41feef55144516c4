use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use huddle_shared::types::RoomCode;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, ApiRateLimiter};
use crate::rooms::RoomRegistry;
use crate::uploads::UploadStore;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistry,
    pub uploads: Arc<UploadStore>,
    pub rate_limiter: ApiRateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.client_origin.as_deref());

    Router::new()
        .route("/health", get(health_check))
        .route("/api/create-room", post(create_room))
        .route("/api/room/{id}", get(get_room))
        .route("/uploads/{filename}", get(serve_upload))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(client_origin: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    match client_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => cors.allow_origin(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Invalid CLIENT_ORIGIN, allowing any origin");
                cors.allow_origin(Any)
            }
        },
        None => cors.allow_origin(Any),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    #[serde(default)]
    host_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResponse {
    room_id: RoomCode,
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfoResponse {
    room_id: RoomCode,
    participant_count: usize,
    exists: bool,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Mint a room. This endpoint is the only way codes come into existence;
/// joining an unminted code fails on the event channel.
async fn create_room(
    State(state): State<AppState>,
    body: Option<Json<CreateRoomRequest>>,
) -> Json<CreateRoomResponse> {
    let room_id = state.registry.mint().await;
    if let Some(Json(req)) = body {
        if let Some(host_id) = req.host_id {
            debug!(room = %room_id, host = %host_id, "Room minted on behalf of a host");
        }
    }
    info!(room = %room_id, "Room created via API");
    Json(CreateRoomResponse {
        room_id,
        success: true,
    })
}

async fn get_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomInfoResponse>, ApiError> {
    let code = RoomCode::folded(&id);
    let participant_count = state
        .registry
        .participant_count(&code)
        .await
        .ok_or(ApiError::RoomNotFound)?;

    Ok(Json(RoomInfoResponse {
        room_id: code,
        participant_count,
        exists: true,
    }))
}

/// Serve a stored upload. Only bare filenames produced by the upload store
/// resolve; anything path-like is refused before touching the filesystem.
async fn serve_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::BadRequest("Invalid filename".into()));
    }

    let path = state.config.upload_dir.join(&filename);
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::FileNotFound)?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    ))
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
