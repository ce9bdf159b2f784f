use crate::llm::error::InvokeError;
use crate::rag::index::IndexError;
use crate::rag::service::QueryError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("后端请求失败: {0}")]
    Backend(String),

    #[error("{0}")]
    Exhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Io(_) | AppError::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Backend(_) => "backend",
            AppError::Exhausted(_) => "quota_exhausted",
            AppError::Io(_) => "io",
            AppError::Anyhow(_) => "internal",
        }
    }
}

impl From<InvokeError> for AppError {
    fn from(e: InvokeError) -> Self {
        match e {
            InvokeError::Config(msg) => Self::Config(msg),
            InvokeError::AllKeysExhausted => Self::Exhausted(e.to_string()),
            InvokeError::Backend(_) | InvokeError::NoResponse => Self::Backend(e.to_string()),
        }
    }
}

impl From<IndexError> for AppError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::NotFound(msg) => Self::NotFound(msg),
            IndexError::InvalidChunking { .. } => Self::BadRequest(e.to_string()),
            IndexError::Io(e) => Self::Io(e),
            IndexError::Json(_) | IndexError::Search(_) => Self::Anyhow(anyhow::Error::new(e)),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotReady => Self::BadRequest(e.to_string()),
            QueryError::Invoke(e) => e.into(),
            QueryError::Index(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{self:#}");
        }

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(self.kind().to_string()),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::http_error;

    #[test]
    fn invoke_errors_map_to_gateway_statuses() {
        assert_eq!(
            AppError::from(InvokeError::AllKeysExhausted).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let backend = AppError::from(InvokeError::Backend(http_error(429, "quota")));
        assert_eq!(backend.status(), StatusCode::BAD_GATEWAY);
        assert!(backend.to_string().contains("429"));
        assert_eq!(
            AppError::from(InvokeError::config("no keys")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn index_and_query_errors_map_to_client_statuses() {
        assert_eq!(
            AppError::from(IndexError::NotFound("missing".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(IndexError::InvalidChunking {
                chunk_size: 10,
                chunk_overlap: 10
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(QueryError::NotReady).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
