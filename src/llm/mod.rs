//! 生成后端的抽象与多 Key 调用管理。

pub mod error;
pub mod invoker;
pub mod retry;

use crate::credential::types::ApiKey;
use error::BackendError;
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub content: String,
}

/// 一次生成调用。实现方不得自行重试，重试策略统一由 [`invoker::Invoker`] 负责。
pub trait ChatBackend: Send + Sync {
    fn generate(
        &self,
        key: &ApiKey,
        messages: &[ChatMessage],
    ) -> impl Future<Output = Result<ChatResponse, BackendError>> + Send;
}
