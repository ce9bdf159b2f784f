//! HTTP API：健康检查、状态、索引构建、问答与文档列表。

pub mod handler;

use crate::llm::ChatBackend;
use crate::logging::LogLevel;
use crate::rag::service::QueryService;
use crate::rag::web::WebSearch;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::sync::Arc;

pub struct AppState<B, W> {
    pub rag: QueryService<B, W>,
    pub log_level: LogLevel,
}

pub fn router<B, W>(state: Arc<AppState<B, W>>) -> Router
where
    B: ChatBackend + 'static,
    W: WebSearch + 'static,
{
    let level = state.log_level;
    let app = Router::new()
        .route("/health", get(handler::handle_health::<B, W>))
        .route("/status", get(handler::handle_status::<B, W>))
        .route("/build-index", post(handler::handle_build_index::<B, W>))
        .route("/query", post(handler::handle_query::<B, W>))
        .route("/docs-info", get(handler::handle_docs_info::<B, W>))
        .with_state(state);

    if level.client_enabled() {
        app.layer(middleware::from_fn(
            move |req: axum::extract::Request, next: middleware::Next| {
                handler::log_client_exchange(level, req, next)
            },
        ))
    } else {
        app
    }
}
