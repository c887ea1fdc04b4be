use std::env;
use std::time::{Duration, Instant};

use anyhow::Context;
use app::bridge::serve_socket;
use app::protocol::{ErrorEnvelope, status_for};
use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;
use webshell::config::ShellConfig;
use webshell::error::{ErrorKind, RegistryError};
use webshell::registry::{SandboxSummary, SessionRegistry};
use webshell::signals::shutdown_signal;
use webshell::telemetry::{DEFAULT_DIRECTIVE, init_tracing};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_MAX_INFLIGHT: usize = 128;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 180;

#[derive(Debug, Clone)]
struct AppConfig {
    host: String,
    port: u16,
    max_inflight: usize,
    request_timeout: Duration,
}

impl AppConfig {
    fn from_env() -> Self {
        let host = env::var("HOST")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());
        Self {
            host,
            port: env_or("PORT", DEFAULT_PORT),
            max_inflight: env_or("WEBSHELL_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT).max(1),
            request_timeout: Duration::from_secs(env_or(
                "WEBSHELL_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
            )),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Clone)]
struct AppState {
    registry: SessionRegistry,
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    session_id: Uuid,
    sandbox: SandboxSummary,
    channel: String,
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    tracing::debug!(%method, %uri, "request");
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

async fn create_session_handler(State(state): State<AppState>) -> Response {
    match state.registry.create().await {
        Ok(created) => {
            let body = CreatedResponse {
                channel: format!("/api/sessions/{}/ws", created.session_id),
                session_id: created.session_id,
                sandbox: created.sandbox,
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(err) => registry_error_response(err),
    }
}

async fn session_info_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.registry.info(id).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => registry_error_response(err),
    }
}

async fn terminate_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.registry.terminate(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => registry_error_response(err),
    }
}

async fn channel_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if state.registry.session(id).is_none() {
        return registry_error_response(RegistryError::NotFound(id));
    }
    upgrade.on_upgrade(move |socket| serve_socket(socket, state.registry, id))
}

fn parse_session_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| error_response(ErrorKind::NotFound, &format!("invalid session id {raw}")))
}

fn registry_error_response(err: RegistryError) -> Response {
    error_response(err.kind(), &err.to_string())
}

fn error_response(kind: ErrorKind, message: &str) -> Response {
    let mut response = Json(ErrorEnvelope::new(kind, message)).into_response();
    *response.status_mut() = status_for(kind);
    response
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_DIRECTIVE);
    let config = AppConfig::from_env();
    let shell = ShellConfig::from_env();
    let registry = SessionRegistry::from_config(&shell);
    let state = AppState {
        registry: registry.clone(),
    };
    let addr = config.addr();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("failed to build runtime")?;
    rt.block_on(async move {
        let api = Router::new()
            .route("/healthz", get(healthcheck))
            .route("/api/sessions", axum::routing::post(create_session_handler))
            .route(
                "/api/sessions/{id}",
                get(session_info_handler).delete(terminate_session_handler),
            )
            .layer(
                ServiceBuilder::new()
                    .layer(CompressionLayer::new())
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        config.request_timeout,
                    )),
            )
            .layer(ConcurrencyLimitLayer::new(config.max_inflight));
        let app = Router::new()
            .route("/api/sessions/{id}/ws", get(channel_handler))
            .merge(api)
            .layer(middleware::from_fn(log_request_response))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, image = %shell.policy.image, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                registry.shutdown_all().await;
            })
            .await
            .context("server error")?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
