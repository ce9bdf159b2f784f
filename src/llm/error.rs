use std::time::Duration;
use thiserror::Error;

/// 单次后端调用失败。
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Gemini API 错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_delay: Duration,
    },

    #[error("Gemini 请求超时（{}ms）", .0.as_millis())]
    Timeout(Duration),

    #[error("Gemini 响应格式异常: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_delay, .. } if *retry_delay != Duration::ZERO => Some(*retry_delay),
            _ => None,
        }
    }
}

/// 调用管理器对外暴露的终态错误。
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("所有 Gemini API Key 均已超出配额")]
    AllKeysExhausted,

    /// 所有可尝试的 Key 都失败后，原样抛出最后一次的后端错误。
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("未能从任何 Gemini API Key 获得响应")]
    NoResponse,
}

impl InvokeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
