use crate::llm::error::BackendError;

/// 失败分类。目前只影响日志：两类错误都走“换 Key 重试”。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Other => "backend_error",
        }
    }
}

const RATE_LIMIT_MARKERS: [&str; 3] = ["quota", "rate", "429"];

/// 只看状态码和后端返回的 message；传输错误的文本里带请求 URL，不参与匹配。
pub fn classify(err: &BackendError) -> FailureKind {
    if err.status() == Some(429) {
        return FailureKind::RateLimited;
    }
    match err {
        BackendError::Http { message, .. } => {
            let msg = message.to_lowercase();
            if RATE_LIMIT_MARKERS.iter().any(|m| msg.contains(m)) {
                FailureKind::RateLimited
            } else {
                FailureKind::Other
            }
        }
        _ => FailureKind::Other,
    }
}
