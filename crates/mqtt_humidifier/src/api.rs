use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine;
use crate::engine::Engine;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    humidifiers: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Body of POST /v1/humidifiers/:entity_id/turn_on
#[derive(Debug, Default, Deserialize)]
struct TurnOnRequest {
    humidity: Option<i64>,
}

/// Body of POST /v1/humidifiers/:entity_id/set_humidity
#[derive(Debug, Deserialize)]
struct SetHumidityRequest {
    humidity: i64,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Map a command routing result to a response
fn command_response(result: Result<(), engine::Error>) -> Response {
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ engine::Error::UnknownEntity(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            humidifiers: state.engine.state_snapshot().humidifiers.len(),
        }),
    )
}

/// Handler for GET /v1/humidifiers
#[tracing::instrument(skip(state))]
async fn list_humidifiers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.state_snapshot().humidifiers.clone())
}

/// Handler for GET /v1/humidifiers/:entity_id
#[tracing::instrument(skip(state))]
async fn get_humidifier(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Response {
    match state.engine.humidifier(&entity_id) {
        Some(humidifier) => Json(humidifier).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("unknown humidifier: {}", entity_id),
        ),
    }
}

/// Handler for POST /v1/humidifiers/:entity_id/turn_on
///
/// The body is optional; `{"humidity": 55}` also sets the target humidity.
/// A body that is present but not a valid request is rejected.
#[tracing::instrument(skip(state, body))]
async fn turn_on(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Response {
    let request = if body.is_empty() {
        TurnOnRequest::default()
    } else {
        match serde_json::from_slice::<TurnOnRequest>(&body) {
            Ok(request) => request,
            Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
        }
    };
    command_response(state.engine.turn_on_humidifier(entity_id, request.humidity))
}

/// Handler for POST /v1/humidifiers/:entity_id/set_humidity
#[tracing::instrument(skip(state))]
async fn set_humidity(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(request): Json<SetHumidityRequest>,
) -> Response {
    command_response(
        state
            .engine
            .set_humidifier_humidity(entity_id, request.humidity),
    )
}

/// Handler for GET /v1/devices
#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.state_snapshot().devices.clone())
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/humidifiers", get(list_humidifiers))
        .route("/v1/humidifiers/:entity_id", get(get_humidifier))
        .route("/v1/humidifiers/:entity_id/turn_on", post(turn_on))
        .route("/v1/humidifiers/:entity_id/set_humidity", post(set_humidity))
        .route("/v1/devices", get(list_devices))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
