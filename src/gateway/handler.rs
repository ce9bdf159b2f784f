use crate::config::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::credential::pool::KeyUsage;
use crate::error::AppError;
use crate::gateway::AppState;
use crate::llm::ChatBackend;
use crate::logging::{self, LogLevel};
use crate::rag::index::{DocListing, Passage};
use crate::rag::service::{BuildOptions, IndexSummary};
use crate::rag::web::{WebResult, WebSearch};
use crate::util::id;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

const MAX_SOURCE_CHARS: usize = 1000;
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rag_ready: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub initialized: bool,
    pub index_built: bool,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexSummary>,
    pub quota_window_secs: u64,
    pub keys: Vec<KeyUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuildIndexRequest {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub rebuild: bool,
}

impl Default for BuildIndexRequest {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            rebuild: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BuildIndexResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub index: IndexSummary,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub use_web_search: bool,
}

#[derive(Debug, Serialize)]
pub struct SourceDocument {
    pub content: String,
    pub source: String,
    pub page: usize,
}

impl From<Passage> for SourceDocument {
    fn from(p: Passage) -> Self {
        let content = match p.content.char_indices().nth(MAX_SOURCE_CHARS) {
            Some((cut, _)) => p.content[..cut].to_string(),
            None => p.content,
        };
        Self {
            content,
            source: p.source,
            page: p.page,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub web_results: Vec<WebResult>,
}

pub async fn handle_health<B, W>(State(state): State<Arc<AppState<B, W>>>) -> Json<HealthResponse>
where
    B: ChatBackend,
    W: WebSearch,
{
    Json(HealthResponse {
        status: "ok",
        rag_ready: state.rag.is_ready(),
    })
}

pub async fn handle_status<B, W>(State(state): State<Arc<AppState<B, W>>>) -> Json<StatusResponse>
where
    B: ChatBackend,
    W: WebSearch,
{
    let index = state.rag.index();
    let snapshot = state.rag.pool_snapshot();
    Json(StatusResponse {
        initialized: true,
        index_built: index.is_some(),
        message: if index.is_some() {
            "RAG system ready"
        } else {
            "RAG system initialized but index not built"
        },
        index: index.as_deref().map(IndexSummary::new),
        quota_window_secs: snapshot.window_secs,
        keys: snapshot.keys,
    })
}

pub async fn handle_build_index<B, W>(
    State(state): State<Arc<AppState<B, W>>>,
    body: Bytes,
) -> Result<Json<BuildIndexResponse>, AppError>
where
    B: ChatBackend,
    W: WebSearch,
{
    let req: BuildIndexRequest = if body.iter().all(u8::is_ascii_whitespace) {
        BuildIndexRequest::default()
    } else {
        sonic_rs::from_slice(&body)
            .map_err(|_| AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。"))?
    };

    let index = state
        .rag
        .build_index(BuildOptions {
            chunk_size: req.chunk_size,
            chunk_overlap: req.chunk_overlap,
            rebuild: req.rebuild,
        })
        .await?;

    Ok(Json(BuildIndexResponse {
        status: "success",
        message: "Index built successfully",
        chunk_size: index.chunk_size,
        chunk_overlap: index.chunk_overlap,
        index,
    }))
}

pub async fn handle_query<B, W>(
    State(state): State<Arc<AppState<B, W>>>,
    body: Bytes,
) -> Result<Json<QueryResponse>, AppError>
where
    B: ChatBackend,
    W: WebSearch,
{
    let req: QueryRequest = sonic_rs::from_slice(&body)
        .map_err(|_| AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。"))?;
    let question = req.question.trim();
    if question.is_empty() {
        return Err(AppError::bad_request("question 不能为空"));
    }

    let request_id = id::request_id();
    let start = Instant::now();
    tracing::info!(%request_id, use_web_search = req.use_web_search, "收到问答请求");

    let result = if req.use_web_search {
        state.rag.query_with_web_search(question, true).await
    } else {
        state.rag.query(question).await
    };
    let out = match result {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%request_id, "问答失败: {e}");
            return Err(e.into());
        }
    };

    tracing::info!(
        %request_id,
        sources = out.sources.len(),
        web_results = out.web_results.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "问答完成"
    );
    Ok(Json(QueryResponse {
        answer: out.answer,
        sources: out.sources.into_iter().map(SourceDocument::from).collect(),
        web_results: out.web_results,
    }))
}

pub async fn handle_docs_info<B, W>(
    State(state): State<Arc<AppState<B, W>>>,
) -> Result<Json<DocListing>, AppError>
where
    B: ChatBackend,
    W: WebSearch,
{
    Ok(Json(state.rag.docs_info().await?))
}

/// 按日志等级输出客户端请求/响应。
pub async fn log_client_exchange(level: LogLevel, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return AppError::bad_request("请求体过大").into_response(),
    };

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    if level.raw_enabled() {
        logging::client_request_raw(method.as_str(), &path, &parts.headers, &bytes);
    } else {
        logging::client_request(method.as_str(), &path, &parts.headers, &bytes);
    }

    let resp = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (parts, body) = resp.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("读取响应体失败: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if level.raw_enabled() {
        logging::client_response_raw(parts.status.as_u16(), start.elapsed(), &bytes);
    } else {
        logging::client_response(parts.status.as_u16(), start.elapsed(), &bytes);
    }
    Response::from_parts(parts, Body::from(bytes))
}
