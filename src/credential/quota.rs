//! 按 Key 维护的滑动窗口请求计数。
//!
//! - 每个 Key 一条时间戳日志（按位置索引）
//! - 用量在读取时按当前时间现算，不缓存
//! - 访问时顺带裁掉已滑出窗口的记录，内存上限约为 `max_requests` 条/Key

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_QUOTA_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_QUOTA_LIMIT: usize = 10;

/// 时间源。生产环境用 [`SystemClock`]，测试里注入可手动拨动的时钟。
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 配额窗口参数，进程内固定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub duration: Duration,
    pub max_requests: usize,
}

impl Default for QuotaWindow {
    fn default() -> Self {
        Self {
            duration: DEFAULT_QUOTA_WINDOW,
            max_requests: DEFAULT_QUOTA_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct QuotaTracker {
    window: QuotaWindow,
    logs: Vec<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(key_count: usize, window: QuotaWindow, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            logs: vec![VecDeque::new(); key_count],
            clock,
        }
    }

    pub fn window(&self) -> QuotaWindow {
        self.window
    }

    /// 记录一次已发出的请求。索引越界时静默忽略。
    pub fn record(&mut self, index: usize) {
        self.reserve(index);
    }

    /// 与 [`record`](Self::record) 相同，但返回写入的时间戳，供 [`release`](Self::release) 精确撤销。
    pub fn reserve(&mut self, index: usize) -> Instant {
        let now = self.clock.now();
        if let Some(log) = self.logs.get_mut(index) {
            // 时钟理论上单调；这里仍按有序插入，保证裁剪只看队首。
            let pos = log.partition_point(|t| *t <= now);
            log.insert(pos, now);
        }
        now
    }

    /// 撤销一条预占记录（调用失败/被取消时）。只移除一条与 `at` 完全相同的记录。
    pub fn release(&mut self, index: usize, at: Instant) {
        let Some(log) = self.logs.get_mut(index) else {
            return;
        };
        if let Some(pos) = log.iter().rposition(|t| *t == at) {
            log.remove(pos);
        }
    }

    /// 窗口内（严格晚于 `now - window`）的请求数。
    pub fn usage(&mut self, index: usize) -> usize {
        let now = self.clock.now();
        let window = self.window.duration;
        let Some(log) = self.logs.get_mut(index) else {
            return 0;
        };
        while let Some(front) = log.front() {
            if now.saturating_duration_since(*front) >= window {
                log.pop_front();
            } else {
                break;
            }
        }
        log.len()
    }

    pub fn is_exceeded(&mut self, index: usize) -> bool {
        self.usage(index) >= self.window.max_requests
    }
}

/// 测试用时钟：从创建时刻开始，只在调用 `advance` 时前进。
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn advance(&self, d: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += d;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}
