use crate::credential::quota::{Clock, QuotaTracker, QuotaWindow};
use crate::credential::rotator::Rotator;
use crate::credential::types::ApiKey;
use crate::llm::error::InvokeError;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Key 池：把轮换游标和各 Key 的请求日志放在同一把锁后面。
///
/// 锁只在同步代码里短暂持有，不跨 `.await`。
#[derive(Debug)]
pub struct KeyPool {
    state: Mutex<State>,
    len: usize,
}

#[derive(Debug)]
struct State {
    rotator: Rotator,
    quota: QuotaTracker,
}

/// 一次 [`KeyPool::acquire`] 的结果。
#[derive(Debug)]
pub enum Acquire<'a> {
    /// 当前 Key 可用，且已预占一个配额名额。
    Ready(Lease<'a>),
    /// 当前 Key 超额，已切到另一个可用 Key；调用方应重新 acquire。
    Rotated { from: usize, to: usize },
    /// 所有 Key 都已超额。
    Exhausted,
}

/// 已预占的配额名额。`commit` 后成为正式记录；未 commit 就被 drop（调用失败或被取消）则自动撤销。
#[derive(Debug)]
pub struct Lease<'a> {
    pool: &'a KeyPool,
    key: ApiKey,
    at: Instant,
    committed: bool,
}

impl Lease<'_> {
    pub fn key(&self) -> &ApiKey {
        &self.key
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.state().quota.release(self.key.index(), self.at);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub index: usize,
    pub key: String,
    pub usage: usize,
    pub limit: usize,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub cursor: usize,
    pub window_secs: u64,
    pub keys: Vec<KeyUsage>,
}

impl KeyPool {
    pub fn new(
        secrets: Vec<String>,
        window: QuotaWindow,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InvokeError> {
        let rotator = Rotator::new(secrets)?;
        let len = rotator.len();
        let quota = QuotaTracker::new(len, window, clock);
        Ok(Self {
            state: Mutex::new(State { rotator, quota }),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn current(&self) -> ApiKey {
        self.state().rotator.current().clone()
    }

    pub fn rotate(&self) -> bool {
        let mut guard = self.state();
        let State { rotator, quota } = &mut *guard;
        rotator.rotate(quota)
    }

    pub fn record(&self, index: usize) {
        self.state().quota.record(index);
    }

    pub fn usage(&self, index: usize) -> usize {
        self.state().quota.usage(index)
    }

    pub fn is_exceeded(&self, index: usize) -> bool {
        self.state().quota.is_exceeded(index)
    }

    /// 选 Key + 配额检查 + 预占，在同一个临界区内完成。
    pub fn acquire(&self) -> Acquire<'_> {
        let mut guard = self.state();
        let State { rotator, quota } = &mut *guard;

        let from = rotator.cursor();
        if quota.is_exceeded(from) {
            tracing::info!(key = from, "Gemini API Key {from} 已超出本地配额");
            if !rotator.rotate(quota) {
                return Acquire::Exhausted;
            }
            return Acquire::Rotated {
                from,
                to: rotator.cursor(),
            };
        }

        let key = rotator.current().clone();
        let at = quota.reserve(from);
        Acquire::Ready(Lease {
            pool: self,
            key,
            at,
            committed: false,
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut guard = self.state();
        let State { rotator, quota } = &mut *guard;
        let window = quota.window();
        let cursor = rotator.cursor();
        let keys = rotator
            .keys()
            .iter()
            .map(|k| KeyUsage {
                index: k.index(),
                key: k.masked(),
                usage: quota.usage(k.index()),
                limit: window.max_requests,
                current: k.index() == cursor,
            })
            .collect();
        PoolSnapshot {
            cursor,
            window_secs: window.duration.as_secs(),
            keys,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // 临界区内没有会 panic 的用户代码；即便中毒，状态也仍然一致。
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::quota::ManualClock;
    use std::time::Duration;

    fn pool(n: usize, max: usize) -> (KeyPool, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let secrets = (0..n).map(|i| format!("secret-key-{i:04}")).collect();
        let pool = KeyPool::new(
            secrets,
            QuotaWindow {
                duration: Duration::from_secs(60),
                max_requests: max,
            },
            clock.clone(),
        )
        .unwrap();
        (pool, clock)
    }

    #[test]
    fn new_rejects_empty_key_set() {
        let clock = ManualClock::new();
        let err = KeyPool::new(Vec::new(), QuotaWindow::default(), clock).unwrap_err();
        assert!(matches!(err, InvokeError::Config(_)));
    }

    #[test]
    fn committed_lease_counts_and_dropped_lease_does_not() {
        let (pool, _) = pool(1, 10);

        match pool.acquire() {
            Acquire::Ready(lease) => lease.commit(),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(pool.usage(0), 1);

        match pool.acquire() {
            Acquire::Ready(lease) => {
                // 在途请求同样占用名额。
                assert_eq!(pool.usage(0), 2);
                drop(lease);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(pool.usage(0), 1);
    }

    #[test]
    fn acquire_rotates_away_from_exceeded_key() {
        let (pool, _) = pool(3, 2);
        pool.record(0);
        pool.record(0);

        match pool.acquire() {
            Acquire::Rotated { from, to } => {
                assert_eq!(from, 0);
                assert_eq!(to, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(pool.current().index(), 1);
        assert!(matches!(pool.acquire(), Acquire::Ready(_)));
    }

    #[test]
    fn acquire_reports_exhaustion() {
        let (pool, clock) = pool(2, 1);
        pool.record(0);
        pool.record(1);
        assert!(matches!(pool.acquire(), Acquire::Exhausted));

        clock.advance(Duration::from_secs(61));
        assert!(matches!(pool.acquire(), Acquire::Ready(_)));
    }

    #[test]
    fn in_flight_leases_hold_the_budget() {
        let (pool, _) = pool(1, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(matches!(a, Acquire::Ready(_)));
        assert!(matches!(b, Acquire::Ready(_)));
        // 两个在途请求已占满，第三个拿不到名额。
        assert!(matches!(pool.acquire(), Acquire::Exhausted));
        drop(a);
        assert!(matches!(pool.acquire(), Acquire::Ready(_)));
        drop(b);
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        let (pool, _) = pool(3, 4);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut granted = 0;
                    for _ in 0..10 {
                        if let Acquire::Ready(lease) = pool.acquire() {
                            lease.commit();
                            granted += 1;
                        }
                    }
                    granted
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 12);
        for i in 0..3 {
            assert_eq!(pool.usage(i), 4);
        }
    }

    #[test]
    fn snapshot_masks_keys_and_marks_current() {
        let (pool, _) = pool(2, 5);
        pool.record(1);
        let snap = pool.snapshot();
        assert_eq!(snap.cursor, 0);
        assert_eq!(snap.window_secs, 60);
        assert!(snap.keys[0].current);
        assert_eq!(snap.keys[1].usage, 1);
        assert!(!snap.keys[1].key.contains("key-0001"));
    }
}
