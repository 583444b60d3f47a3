//! HTTP surface of the relay.
//!
//! | Route                | Purpose                                               |
//! |----------------------|-------------------------------------------------------|
//! | `POST /chat`         | Run one orchestration and stream its events over SSE  |
//! | `GET /api/get_models`| Forward the upstream model listing                    |
//! | `GET /health`        | Report service and tool process status                |
//! | `/static/*`          | Optional static client bundle                         |
//!
//! Every `/chat` request gets its own event channel. The orchestration runs
//! in a spawned task and is dropped as soon as the browser goes away, so a
//! disconnected client never keeps an upstream stream or tool call alive.

use crate::config::RelayConfig;
use crate::emitter::{ClientEvent, DEFAULT_EVENT_BUFFER, event_channel};
use crate::mcp::{SessionStatus, ToolProcessManager};
use crate::orchestrator::Orchestrator;
use crate::types::ChatRequest;
use crate::upstream::{ModelCatalog, ModelInfo};
use crate::{Error, Result};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<Value>);

/// Shared handles used by the route handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    models: Arc<dyn ModelCatalog>,
    tool_process: Arc<ToolProcessManager>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        models: Arc<dyn ModelCatalog>,
        tool_process: Arc<ToolProcessManager>,
    ) -> Self {
        Self {
            orchestrator,
            models,
            tool_process,
        }
    }

    pub fn tool_process(&self) -> &Arc<ToolProcessManager> {
        &self.tool_process
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub tool_process: SessionStatus,
    pub tools: Vec<String>,
    pub version: &'static str,
}

/// Assemble the router with CORS, request tracing and optional static files.
pub fn build_router(state: AppState, config: &RelayConfig) -> Router {
    let mut router = Router::new()
        .route("/chat", post(chat_handler))
        .route("/api/get_models", get(models_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        info!("Serving static files from {}", dir.display());
        router = router.nest_service("/static", ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Response, ApiError> {
    let (api_key, model) = match request.credentials() {
        Ok((key, model)) => (key.to_string(), model.to_string()),
        Err(e) => {
            warn!("Rejecting chat request: {}", e);
            return Err(detail(StatusCode::BAD_REQUEST, "apiKey and modelId are required"));
        }
    };

    info!(
        "Chat request: model={}, history={} messages, image={}",
        model,
        request.messages.len(),
        request.image_data.is_some()
    );

    let history = request.conversation();
    let orchestrator = Arc::clone(&state.orchestrator);
    let (emitter, rx) = event_channel(DEFAULT_EVENT_BUFFER);

    tokio::spawn(async move {
        let mut run = orchestrator.new_state(history);
        tokio::select! {
            result = orchestrator.run(&model, &api_key, &mut run, &emitter) => {
                match result {
                    Ok(()) => debug!("Chat run finished"),
                    Err(e) => debug!("Chat run ended early: {}", e),
                }
            }
            _ = emitter.closed() => {
                info!("Client disconnected, cancelling chat run");
            }
        }
    });

    Ok(event_stream(rx))
}

fn event_stream(rx: mpsc::Receiver<ClientEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| Event::default().json_data(&event));

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

async fn models_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<Vec<ModelInfo>>, ApiError> {
    let Some(api_key) = bearer_token(&headers) else {
        return Err(detail(
            StatusCode::UNAUTHORIZED,
            "Missing or malformed Authorization header",
        ));
    };

    match state.models.list_models(api_key).await {
        Ok(models) => Ok(Json(models)),
        Err(e) => {
            error!("Model listing failed: {}", e);
            Err(detail(listing_failure_status(&e), "Failed to fetch models from upstream"))
        }
    }
}

/// Upstream error statuses pass through; transport failures become 502.
fn listing_failure_status(error: &Error) -> StatusCode {
    if let Some(status) = error
        .upstream_http_status()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .filter(|s| s.is_client_error() || s.is_server_error())
    {
        return status;
    }
    match error {
        Error::Http(_) | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let tool_process = state.tool_process.status();
    Json(HealthResponse {
        status: if tool_process == SessionStatus::Ready {
            "ok"
        } else {
            "degraded"
        },
        tool_process,
        tools: state.tool_process.tools(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn detail(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "detail": message })))
}

/// Serve until `shutdown` resolves.
///
/// The tool process is not touched here; callers disconnect it once this
/// returns.
pub async fn serve<F>(config: &RelayConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state, config);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| Error::config(format!("Failed to bind to {}: {}", config.bind_addr, e)))?;

    info!("thinking-relay listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
