// src/api.rs
//! HTTP surface: public news/ticker reads plus admin ingestion controls.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::{parse_bool, Settings};
use crate::ingest::runs::RunStatusView;
use crate::ingest::scheduler::{Scheduler, TriggerOutcome};
use crate::model::Article;
use crate::query::{NewsParams, QueryError, QueryService};
use crate::store::{DynStore, StoreError};
use crate::universe::{TickerEntry, UniverseHandle};

const DEFAULT_STATUS_LIMIT: usize = 10;
const MAX_STATUS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub scheduler: Arc<Scheduler>,
    pub universe: UniverseHandle,
    pub store: DynStore,
}

pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tickers", get(list_tickers))
        .route("/news", get(list_news))
        .route("/news/count", get(count_news))
        .route("/news/{id}", get(get_news))
        .route("/admin/ingest/run-once", post(run_once))
        .route("/admin/ingest/status", get(ingest_status))
        .route("/admin/tickers/reload", post(reload_tickers))
        .layer(cors)
        .with_state(state)
}

/// `*` (or nothing configured) allows any origin; otherwise only the listed ones.
pub fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_is_permissive() {
        return CorsLayer::very_permissive();
    }
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(target: "api", origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(detail) => {
                error!(target: "api", error = %detail, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        if e.is_client_error() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct HealthOut {
    status: &'static str,
    time: chrono::DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthOut>) {
    let (code, status) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!(target: "api", error = %e, "store ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    (
        code,
        Json(HealthOut {
            status,
            time: Utc::now(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct TickersParams {
    q: Option<String>,
    active: Option<String>,
}

#[derive(Serialize)]
struct TickersOut {
    items: Vec<TickerEntry>,
    total: usize,
}

async fn list_tickers(
    State(state): State<AppState>,
    Query(p): Query<TickersParams>,
) -> Result<Json<TickersOut>, ApiError> {
    let active = match p.active.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(v) => Some(
            parse_bool(v).ok_or_else(|| ApiError::BadRequest("`active` must be true or false".into()))?,
        ),
        None => None,
    };
    let needle = p
        .q
        .as_deref()
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());

    let universe = state.universe.snapshot();
    let items: Vec<TickerEntry> = universe
        .entries()
        .filter(|e| active.map_or(true, |a| e.active == a))
        .filter(|e| {
            needle.as_deref().map_or(true, |n| {
                e.symbol.to_lowercase().contains(n) || e.fund_name.to_lowercase().contains(n)
            })
        })
        .cloned()
        .collect();
    Ok(Json(TickersOut {
        total: items.len(),
        items,
    }))
}

#[derive(Serialize)]
struct NewsMeta {
    count: usize,
    limit: usize,
    sort: &'static str,
}

#[derive(Serialize)]
struct NewsOut {
    items: Vec<Article>,
    next_cursor: Option<String>,
    meta: NewsMeta,
}

async fn list_news(
    State(state): State<AppState>,
    Query(params): Query<NewsParams>,
) -> Result<Json<NewsOut>, ApiError> {
    let query = state.query.parse(params)?;
    let page = state.query.list(&query).await?;
    Ok(Json(NewsOut {
        meta: NewsMeta {
            count: page.items.len(),
            limit: query.limit,
            sort: "latest",
        },
        items: page.items,
        next_cursor: page.next_cursor,
    }))
}

async fn count_news(
    State(state): State<AppState>,
    Query(params): Query<NewsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = state.query.parse(params)?;
    let total = state.query.count(&query.filter).await?;
    Ok(Json(json!({ "total": total })))
}

async fn get_news(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Article>, ApiError> {
    let id: i64 = id
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid article id: {id}")))?;
    state
        .query
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("article {id} not found")))
}

async fn run_once(State(state): State<AppState>) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let outcome = state.scheduler.trigger_once().await?;
    let code = match outcome {
        TriggerOutcome::Started { run_id } => {
            info!(target: "api", run_id, "manual ingestion run started");
            StatusCode::ACCEPTED
        }
        TriggerOutcome::Skipped => StatusCode::CONFLICT,
    };
    Ok((code, Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    limit: Option<String>,
}

async fn ingest_status(
    State(state): State<AppState>,
    Query(p): Query<StatusParams>,
) -> Result<Json<RunStatusView>, ApiError> {
    let limit = match p.limit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => DEFAULT_STATUS_LIMIT,
        Some(s) => match s.parse::<usize>() {
            Ok(n) if (1..=MAX_STATUS_LIMIT).contains(&n) => n,
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "`limit` must be an integer between 1 and {MAX_STATUS_LIMIT}"
                )))
            }
        },
    };
    let view = state.scheduler.pipeline().tracker().status(limit).await?;
    Ok(Json(view))
}

async fn reload_tickers(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let universe = state
        .universe
        .reload()
        .map_err(|e| ApiError::Internal(format!("ticker reload failed: {e:#}")))?;
    Ok(Json(json!({
        "loaded": universe.len(),
        "active": universe.active().count(),
    })))
}
