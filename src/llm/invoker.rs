//! 多 Key 调用管理：配额预检 → 调用 → 失败换 Key 重试。
//!
//! 每次调用最多尝试 N 次（N = Key 数量），保证终止：
//! - 当前 Key 本地超额：换 Key，计入尝试次数；无 Key 可换则直接返回 `AllKeysExhausted`
//! - 后端成功：记录到该 Key 的配额日志并立即返回
//! - 后端失败（限流或其它错误一视同仁）：换 Key 重试；无 Key 可换则抛出最后一次错误

use crate::credential::pool::{Acquire, KeyPool};
use crate::credential::types::ApiKey;
use crate::llm::error::{BackendError, InvokeError};
use crate::llm::retry::{FailureKind, classify};
use crate::llm::{ChatBackend, ChatMessage, ChatResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Invoker<B> {
    backend: B,
    pool: Arc<KeyPool>,
    timeout: Option<Duration>,
}

impl<B: ChatBackend> Invoker<B> {
    pub fn new(backend: B, pool: Arc<KeyPool>) -> Self {
        Self {
            backend,
            pool,
            timeout: None,
        }
    }

    /// 单次后端调用的超时；`Duration::ZERO` 表示不限制。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (timeout > Duration::ZERO).then_some(timeout);
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatResponse, InvokeError> {
        self.invoke_with_timeout(messages, self.timeout).await
    }

    pub async fn invoke_with_timeout(
        &self,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, InvokeError> {
        let attempts = self.pool.len().max(1);
        let mut last_err: Option<BackendError> = None;

        for attempt in 0..attempts {
            let lease = match self.pool.acquire() {
                Acquire::Ready(lease) => lease,
                Acquire::Rotated { from, to } => {
                    tracing::debug!(attempt, from, to, "本地配额超额，换 Key 后重新选择");
                    continue;
                }
                Acquire::Exhausted => return Err(InvokeError::AllKeysExhausted),
            };
            let index = lease.key().index();

            let start = Instant::now();
            let result = self.call(lease.key(), messages, timeout).await;
            match result {
                Ok(resp) => {
                    lease.commit();
                    tracing::info!(
                        key = index,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Gemini API Key {index} 调用成功"
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    // 失败的调用不计入配额。
                    drop(lease);
                    let kind = classify(&e);
                    match kind {
                        FailureKind::RateLimited => tracing::warn!(
                            key = index,
                            attempt,
                            kind = kind.as_str(),
                            retry_delay = ?e.retry_delay(),
                            "Gemini API Key {index} 被限流: {e}"
                        ),
                        FailureKind::Other => tracing::warn!(
                            key = index,
                            attempt,
                            kind = kind.as_str(),
                            "Gemini API Key {index} 调用失败: {e}"
                        ),
                    }
                    last_err = Some(e);
                    if !self.pool.rotate() {
                        break;
                    }
                }
            }
        }

        Err(last_err.map_or(InvokeError::NoResponse, InvokeError::Backend))
    }

    async fn call(
        &self,
        key: &ApiKey,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, BackendError> {
        let fut = self.backend.generate(key, messages);
        match timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .unwrap_or(Err(BackendError::Timeout(t))),
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::quota::{ManualClock, QuotaWindow};
    use crate::llm::testing::{ScriptedBackend, http_error};

    fn pool(n: usize, max: usize) -> Arc<KeyPool> {
        let secrets = (0..n).map(|i| format!("key-{i}")).collect();
        Arc::new(
            KeyPool::new(
                secrets,
                QuotaWindow {
                    duration: Duration::from_secs(60),
                    max_requests: max,
                },
                ManualClock::new(),
            )
            .unwrap(),
        )
    }

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("What is in the docs?"),
        ]
    }

    #[tokio::test]
    async fn success_records_against_current_key() {
        let pool = pool(2, 10);
        let invoker = Invoker::new(ScriptedBackend::new(vec![Ok("hi".into())]), pool.clone());

        let resp = invoker.invoke(&messages()).await.unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(invoker.backend.calls(), vec![0]);
        assert_eq!(pool.usage(0), 1);
        assert_eq!(pool.usage(1), 0);
        // 成功不触发轮换。
        assert_eq!(pool.current().index(), 0);
    }

    #[tokio::test]
    async fn saturated_key_is_skipped_without_a_backend_call() {
        let pool = pool(3, 10);
        for _ in 0..10 {
            pool.record(0);
        }
        let invoker = Invoker::new(ScriptedBackend::new(Vec::new()), pool.clone());

        let resp = invoker.invoke(&messages()).await.unwrap();
        assert_eq!(resp.content, "answer from key 1");
        assert_eq!(invoker.backend.calls(), vec![1]);
        assert_eq!(pool.usage(0), 10);
        assert_eq!(pool.usage(1), 1);
    }

    #[tokio::test]
    async fn all_keys_exceeded_fails_without_calling_backend() {
        let pool = pool(3, 2);
        for i in 0..3 {
            pool.record(i);
            pool.record(i);
        }
        let invoker = Invoker::new(ScriptedBackend::new(Vec::new()), pool.clone());

        let err = invoker.invoke(&messages()).await.unwrap_err();
        assert!(matches!(err, InvokeError::AllKeysExhausted));
        assert!(invoker.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn single_key_rate_limit_propagates_original_error() {
        let pool = pool(1, 10);
        let backend = ScriptedBackend::new(vec![Err(http_error(429, "429 rate limit"))]);
        let invoker = Invoker::new(backend, pool.clone());

        let err = invoker.invoke(&messages()).await.unwrap_err();
        match err {
            InvokeError::Backend(BackendError::Http { status, message, .. }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "429 rate limit");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(invoker.backend.calls(), vec![0]);
        assert_eq!(pool.usage(0), 0);
    }

    #[tokio::test]
    async fn failed_key_is_rotated_and_left_untouched() {
        let pool = pool(2, 10);
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Malformed("missing candidates".into())),
            Ok("from key 1".into()),
        ]);
        let invoker = Invoker::new(backend, pool.clone());

        let resp = invoker.invoke(&messages()).await.unwrap();
        assert_eq!(resp.content, "from key 1");
        assert_eq!(invoker.backend.calls(), vec![0, 1]);
        assert_eq!(pool.usage(0), 0);
        assert_eq!(pool.usage(1), 1);
        // 游标保持在成功的 Key 上，下一次调用直接用它。
        assert_eq!(pool.current().index(), 1);
    }

    #[tokio::test]
    async fn every_key_failing_returns_last_error() {
        let pool = pool(3, 10);
        let backend = ScriptedBackend::new(vec![
            Err(http_error(500, "first")),
            Err(http_error(503, "second")),
            Err(http_error(400, "third")),
        ]);
        let invoker = Invoker::new(backend, pool.clone());

        let err = invoker.invoke(&messages()).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Backend(BackendError::Http { status: 400, .. })
        ));
        assert_eq!(invoker.backend.calls(), vec![0, 1, 2]);
        for i in 0..3 {
            assert_eq!(pool.usage(i), 0);
        }
    }

    #[tokio::test]
    async fn rotation_is_sticky_across_invocations() {
        let pool = pool(3, 10);
        let backend = ScriptedBackend::new(vec![Err(http_error(429, "quota")), Ok("a".into())]);
        let invoker = Invoker::new(backend, pool.clone());

        invoker.invoke(&messages()).await.unwrap();
        invoker.invoke(&messages()).await.unwrap();
        assert_eq!(invoker.backend.calls(), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn timeout_is_treated_as_backend_failure() {
        let pool = pool(1, 10);
        let backend = ScriptedBackend::new(Vec::new()).with_delay(Duration::from_secs(5));
        let invoker = Invoker::new(backend, pool.clone()).with_timeout(Duration::from_millis(20));

        let err = invoker.invoke(&messages()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Backend(BackendError::Timeout(_))));
        assert_eq!(pool.usage(0), 0);
    }

    #[tokio::test]
    async fn dropped_invocation_releases_reservation() {
        let pool = pool(1, 10);
        let backend = ScriptedBackend::new(Vec::new()).with_delay(Duration::from_secs(5));
        let invoker = Invoker::new(backend, pool.clone());

        let msgs = messages();
        let fut = invoker.invoke(&msgs);
        let _ = tokio::time::timeout(Duration::from_millis(20), fut).await;
        assert_eq!(pool.usage(0), 0);
    }
}
