//! REST surface over [`KernelService`].

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ks_core::{
    Chunk, ComposeTrace, Refusal, ScoredChunk, ScoredTension, Tension, TensionGraph,
};
use ks_store::{KernelRecord, KernelStats};

use crate::service::{Document, IngestReport, KernelService, ServiceError, ServiceResult};

const DEFAULT_DEEP_LIMIT: usize = 100;

type AppState = Arc<KernelService>;

#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

async fn blocking<T, F>(svc: AppState, f: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&KernelService) -> ServiceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&svc))
        .await
        .map_err(|e| ApiError(ServiceError::Internal(format!("task failed: {e}"))))?
        .map_err(ApiError)
}

// --- Request / response types ---

#[derive(Debug, Deserialize)]
struct CreateKernelBody {
    name: String,
    #[serde(default)]
    bio: String,
    #[serde(default)]
    era: String,
}

#[derive(Debug, Serialize)]
struct KernelDetail {
    #[serde(flatten)]
    record: KernelRecord,
    stats: KernelStats,
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    kernel_id: String,
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    kernel_id: String,
    message: String,
    #[serde(default)]
    masks: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Used {
    tensions: Vec<ScoredTension>,
    chunks: Vec<ScoredChunk>,
}

#[derive(Debug, Serialize)]
struct ChatReply {
    answer: String,
    refused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    refusal: Option<Refusal>,
    trace: ComposeTrace,
    used: Used,
}

#[derive(Debug, Deserialize)]
struct KernelQuery {
    kernel_id: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Contradictions {
    contradictions: Vec<Tension>,
}

#[derive(Debug, Serialize)]
struct Deep {
    deep: Vec<Chunk>,
    total: u64,
}

// --- Routes ---

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/kernels", post(create_kernel).get(list_kernels))
        .route("/kernels/{id}", get(get_kernel).delete(delete_kernel))
        .route("/ingest", post(ingest))
        .route("/chat", post(chat))
        .route("/contradictions", get(contradictions))
        .route("/graph", get(graph))
        .route("/deep", get(deep))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

pub async fn serve(service: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
            }
        })
        .await
        .context("http server failed")
}

// --- Handlers ---

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "service": "kernel-studio" }))
}

async fn create_kernel(
    State(svc): State<AppState>,
    Json(body): Json<CreateKernelBody>,
) -> std::result::Result<(StatusCode, Json<KernelRecord>), ApiError> {
    let record = blocking(svc, move |s| s.create_kernel(&body.name, &body.bio, &body.era)).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_kernels(State(svc): State<AppState>) -> ApiResult<Vec<KernelRecord>> {
    Ok(Json(blocking(svc, |s| s.list_kernels()).await?))
}

async fn get_kernel(State(svc): State<AppState>, Path(id): Path<String>) -> ApiResult<KernelDetail> {
    let detail = blocking(svc, move |s| {
        Ok(KernelDetail {
            record: s.get_kernel(&id)?,
            stats: s.stats(&id)?,
        })
    })
    .await?;
    Ok(Json(detail))
}

async fn delete_kernel(State(svc): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    blocking(svc, move |s| s.delete_kernel(&id)).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn ingest(State(svc): State<AppState>, Json(body): Json<IngestBody>) -> ApiResult<IngestReport> {
    let report = blocking(svc, move |s| s.ingest(&body.kernel_id, &body.documents)).await?;
    Ok(Json(report))
}

async fn chat(State(svc): State<AppState>, Json(body): Json<ChatBody>) -> ApiResult<ChatReply> {
    let outcome = blocking(svc, move |s| s.chat(&body.kernel_id, &body.message, &body.masks)).await?;
    let used = Used {
        tensions: outcome
            .pack
            .tensions
            .iter()
            .map(|st| ScoredTension {
                tension: st.tension.without_embedding(),
                ..st.clone()
            })
            .collect(),
        chunks: outcome
            .pack
            .chunks
            .iter()
            .map(|sc| ScoredChunk {
                chunk: sc.chunk.without_embedding(),
                similarity: sc.similarity,
            })
            .collect(),
    };
    Ok(Json(ChatReply {
        answer: outcome.answer,
        refused: outcome.refused,
        refusal: outcome.refusal,
        trace: outcome.trace,
        used,
    }))
}

async fn contradictions(
    State(svc): State<AppState>,
    Query(q): Query<KernelQuery>,
) -> ApiResult<Contradictions> {
    let limit = q.limit.unwrap_or(usize::MAX);
    let tensions = blocking(svc, move |s| s.tensions(&q.kernel_id, limit)).await?;
    Ok(Json(Contradictions {
        contradictions: tensions,
    }))
}

async fn graph(State(svc): State<AppState>, Query(q): Query<KernelQuery>) -> ApiResult<TensionGraph> {
    Ok(Json(blocking(svc, move |s| s.graph(&q.kernel_id)).await?))
}

async fn deep(State(svc): State<AppState>, Query(q): Query<KernelQuery>) -> ApiResult<Deep> {
    let limit = q.limit.unwrap_or(DEFAULT_DEEP_LIMIT);
    let deep = blocking(svc, move |s| {
        Ok(Deep {
            deep: s.chunks(&q.kernel_id, limit)?,
            total: s.stats(&q.kernel_id)?.chunks,
        })
    })
    .await?;
    Ok(Json(deep))
}
