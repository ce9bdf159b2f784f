use crate::credential::quota::QuotaTracker;
use crate::credential::types::{ApiKey, usable_secrets};
use crate::llm::error::InvokeError;

/// 持有轮换游标，决定当前使用哪个 Key。
#[derive(Debug)]
pub struct Rotator {
    keys: Vec<ApiKey>,
    cursor: usize,
}

impl Rotator {
    /// 去掉空白 Key 后为空视为配置错误。
    pub fn new(secrets: Vec<String>) -> Result<Self, InvokeError> {
        let secrets = usable_secrets(secrets.into_iter().map(Some));
        if secrets.is_empty() {
            return Err(InvokeError::config("没有可用的 Gemini API Key"));
        }
        let keys = secrets
            .into_iter()
            .enumerate()
            .map(|(i, s)| ApiKey::new(i, s))
            .collect();
        Ok(Self { keys, cursor: 0 })
    }

    pub fn current(&self) -> &ApiKey {
        &self.keys[self.cursor]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[ApiKey] {
        &self.keys
    }

    /// 从游标位置向后（取模）依次探测，停在第一个未超配额的 Key 上。
    ///
    /// 最多探测 N 次；全部超额时游标停在最后探测的位置并返回 `false`。
    /// 只有一个 Key 时探测的就是它自己。
    pub fn rotate(&mut self, quota: &mut QuotaTracker) -> bool {
        let from = self.cursor;
        let n = self.keys.len();
        for _ in 0..n {
            self.cursor = (self.cursor + 1) % n;
            if !quota.is_exceeded(self.cursor) {
                tracing::info!(from, to = self.cursor, "切换 Gemini API Key：{from} -> {}", self.cursor);
                return true;
            }
        }
        tracing::warn!(keys = n, "所有 Gemini API Key 均已超出配额");
        false
    }
}
