//! 指数退避重试

use crate::error::{MirrorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 单次退避的上限
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 重试策略：最多重试 `max_retries` 次，第 n 次重试前等待 `base_delay * 2^n`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// 重试结果，附带实际尝试次数
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// 第 `attempt` 次重试前的等待时间（从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// 执行操作，瞬时错误按退避重试；取消时立即返回 `Cancelled`
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Attempted {
                    result: Err(MirrorError::Cancelled),
                    attempts: attempt,
                };
            }

            let result = op().await;
            attempt += 1;

            let err = match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt > self.max_retries {
                if err.is_transient() && self.max_retries > 0 {
                    error!("{} 最终失败 (已重试{}次): {}", what, self.max_retries, err);
                }
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.backoff(attempt - 1);
            warn!(
                "{} 失败，{}ms 后重试 ({}/{}): {}",
                what,
                delay.as_millis(),
                attempt,
                self.max_retries,
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Attempted {
                        result: Err(MirrorError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> MirrorError {
        MirrorError::Fetch {
            url: "http://h/x".to_string(),
            message: "503".to_string(),
            transient: true,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(20), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let cancel = CancellationToken::new();

        let outcome = policy
            .run("probe", &cancel, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let cancel = CancellationToken::new();

        let outcome: Attempted<()> = policy.run("probe", &cancel, || async { Err(transient()) }).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let outcome: Attempted<()> = policy
            .run("list", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MirrorError::structural("http://h/", "cycle"))
            })
            .await;

        assert!(matches!(outcome.result, Err(MirrorError::Structural { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: Attempted<()> = policy.run("x", &cancel, || async { Ok(()) }).await;
        assert!(matches!(outcome.result, Err(MirrorError::Cancelled)));
        assert_eq!(outcome.attempts, 0);
    }
}
