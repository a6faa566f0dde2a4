//! Axum read API over the stored hierarchy.

use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tiersync_core::{Child, Grandchild, Parent, RowId};
use tiersync_storage::{HierarchyStore, StoreError};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod rate_limit;

pub use rate_limit::RateLimiter;

pub const CRATE_NAME: &str = "tiersync-web";

/// Every listing is a bounded read without a cursor.
pub const PAGE_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit_points: u32,
    pub rate_limit_window: Duration,
    pub cors_origins: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            rate_limit_points: 5,
            rate_limit_window: Duration::from_secs(60),
            cors_origins: Vec::new(),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("TIERSYNC_WEB_HOST").unwrap_or(defaults.host),
            port: env_or("TIERSYNC_WEB_PORT", defaults.port),
            rate_limit_points: env_or("TIERSYNC_RATE_LIMIT_POINTS", defaults.rate_limit_points),
            rate_limit_window: Duration::from_secs(env_or(
                "TIERSYNC_RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window.as_secs(),
            )),
            cors_origins: std::env::var("TIERSYNC_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    setting_or(key, std::env::var(key).ok().as_deref(), default)
}

fn setting_or<T: FromStr>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(key, value = raw, "ignoring malformed setting");
        default
    })
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HierarchyStore>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(store: Arc<dyn HierarchyStore>, config: &WebConfig) -> Self {
        Self {
            store,
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_points,
                config.rate_limit_window,
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("too many requests")]
    RateLimited,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response(),
            ApiError::Store(err) => {
                error!(error = %err, "read query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct CountResponse {
    count: i64,
}

pub fn app(state: AppState, config: &WebConfig) -> Router {
    let state = Arc::new(state);
    let data_routes = Router::new()
        .route("/api/parents", get(parents_handler))
        .route("/api/parents/count", get(parent_count_handler))
        .route("/api/parents/{id}/children", get(children_handler))
        .route("/api/children/{id}/grandchildren", get(grandchildren_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit));

    Router::new()
        .merge(data_routes)
        .route("/api/openapi.json", get(openapi_handler))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: WebConfig,
    store: Arc<dyn HierarchyStore>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let router = app(AppState::new(store, &config), &config);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    info!("read API listening on http://{address}");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let parsed = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect::<Vec<_>>();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
}

async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.limiter.try_consume(&client).await {
        return ApiError::RateLimited.into_response();
    }
    next.run(req).await
}

async fn parents_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Parent>>, ApiError> {
    Ok(Json(state.store.list_parents(PAGE_LIMIT).await?))
}

async fn parent_count_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CountResponse>, ApiError> {
    let count = state.store.count_parents().await?;
    Ok(Json(CountResponse { count }))
}

async fn children_handler(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<RowId>,
) -> Result<Json<Vec<Child>>, ApiError> {
    Ok(Json(state.store.list_children(parent_id, PAGE_LIMIT).await?))
}

async fn grandchildren_handler(
    State(state): State<Arc<AppState>>,
    Path(child_id): Path<RowId>,
) -> Result<Json<Vec<Grandchild>>, ApiError> {
    Ok(Json(state.store.list_grandchildren(child_id, PAGE_LIMIT).await?))
}

async fn openapi_handler() -> Json<serde_json::Value> {
    let id_param = |name: &str| {
        serde_json::json!([{
            "name": name,
            "in": "path",
            "required": true,
            "schema": {"type": "integer", "format": "int64"}
        }])
    };
    Json(serde_json::json!({
        "openapi": "3.0.0",
        "info": {
            "title": "tiersync read API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Bounded lookups over synced parents, children and grandchildren."
        },
        "paths": {
            "/api/parents": {
                "get": {"summary": "First 10 parents", "responses": {"200": {"description": "parents"}, "429": {"description": "rate limited"}}}
            },
            "/api/parents/count": {
                "get": {"summary": "Number of stored parents", "responses": {"200": {"description": "count"}}}
            },
            "/api/parents/{id}/children": {
                "get": {"summary": "First 10 children of a parent", "parameters": id_param("id"), "responses": {"200": {"description": "children"}}}
            },
            "/api/children/{id}/grandchildren": {
                "get": {"summary": "First 10 grandchildren of a child", "parameters": id_param("id"), "responses": {"200": {"description": "grandchildren"}}}
            }
        }
    }))
}
