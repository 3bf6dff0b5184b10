use crate::broadcaster::Broadcaster;
use crate::commands::CommandService;
use crate::errors::Error;
use crate::model::{Device, DeviceUpdate};
use crate::registry::DeviceRegistry;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{AllowHeaders, CorsLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn DeviceRegistry>,
    pub commands: Arc<CommandService>,
    pub broadcaster: Broadcaster,
    pub sse_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    device_id: String,
    command: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    uid: String,
    #[serde(alias = "deviceName")]
    name: Option<String>,
    device_type: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PublishParams {
    topic: String,
    message: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/", get(list_devices))
        .route("/devices/register", post(register_device))
        .route(
            "/devices/:key",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/devices/:key/command", post(send_command))
        .route("/mqtt/publish", post(publish_message))
        .route("/sse/mqtt", get(stream_messages))
        .with_state(state)
}

/// Cross-origin policy for the dashboard served from `origin`.
pub fn cors_layer(origin: &str) -> crate::errors::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)
        .map_err(|e| Error::Validation(format!("invalid CORS origin '{}': {}", origin, e)))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600)))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    let devices = state.registry.list().await?;
    Ok(Json(devices))
}

async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Device>, AppError> {
    let name = request.name.unwrap_or_else(|| request.uid.clone());
    let status = request.status.unwrap_or_else(|| "offline".to_string());
    let device = Device::new(request.uid, name, request.device_type, status);

    let stored = state.registry.upsert(device).await?;
    info!("Registered device [{}] via HTTP as id {}", stored.uid, stored.id);
    Ok(Json(stored))
}

/// `key` is tried as a uid first, then as a numeric id.
async fn get_device(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Device>, AppError> {
    if let Some(device) = state.registry.find_by_uid(&key).await? {
        return Ok(Json(device));
    }
    let by_id = match key.parse::<i64>() {
        Ok(id) => state.registry.find_by_id(id).await?,
        Err(_) => None,
    };
    by_id.map(Json).ok_or_else(|| Error::NotFound(key).into())
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<DeviceUpdate>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .registry
        .update(id, update)
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    Ok(Json(device))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.registry.delete(id).await? {
        return Err(Error::NotFound(id.to_string()).into());
    }
    info!("Deleted device id {}", id);
    Ok(Json(json!({ "deleted": id })))
}

async fn send_command(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    let command = state.commands.send_command(&uid, &request.command).await?;
    Ok(Json(CommandResponse {
        device_id: uid,
        command,
    }))
}

async fn publish_message(
    State(state): State<AppState>,
    Query(params): Query<PublishParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .commands
        .publish_message(&params.topic, &params.message)
        .await?;
    Ok(Json(json!({ "topic": params.topic, "published": true })))
}

async fn stream_messages(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = state
        .broadcaster
        .register_subscriber()
        .expire_after(state.sse_timeout);
    info!(
        "Push subscriber {} attached, {} active",
        subscriber.lifecycle().id(),
        state.broadcaster.subscriber_count()
    );

    let events = subscriber.map(|event| Ok(Event::default().event(event.name).data(event.data)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidCommand(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
