use crate::core::error::ExchangeError;
/// 带指数退避的重试策略
use std::time::Duration;
use tokio::time::sleep;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 是否添加抖动
    pub jitter: bool,
    /// 限流错误的退避下限（毫秒）
    pub rate_limit_floor_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter: true,
            rate_limit_floor_ms: 2_000,
        }
    }
}

/// 指数退避重试策略
pub struct ExponentialBackoffRetry {
    config: RetryConfig,
}

impl ExponentialBackoffRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// 判断是否应该重试
    pub fn should_retry(&self, error: &ExchangeError, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        error.is_retryable()
    }

    /// 计算重试延迟
    ///
    /// 限流错误使用更高的退避下限，普通瞬时错误从 initial_delay 起步。
    pub fn calculate_delay(&self, error: &ExchangeError, attempt: u32) -> Duration {
        let base_delay =
            self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(attempt as i32);

        let floor_ms = match error {
            ExchangeError::RateLimitError(_, retry_after) => retry_after
                .map(|s| s * 1000)
                .unwrap_or(self.config.rate_limit_floor_ms),
            _ => 0,
        };

        let mut delay_ms = (base_delay.min(self.config.max_delay_ms as f64) as u64).max(floor_ms);

        // 添加抖动以避免雷同重试
        if self.config.jitter && delay_ms > 0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0..=delay_ms / 4);
            delay_ms += jitter;
        }

        Duration::from_millis(delay_ms)
    }

    /// 执行带重试的操作
    pub async fn execute_with_retry<F, T, Fut>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        log::info!("✅ 操作在第{}次尝试后成功", attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        if attempt > 0 {
                            log::error!("❌ 重试预算耗尽: {:?}", error);
                        }
                        return Err(error);
                    }

                    let delay = self.calculate_delay(&error, attempt);
                    log::warn!(
                        "⚠️ 操作失败，将在{:.2}秒后重试 (尝试 {}/{}): {:?}",
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.config.max_retries,
                        error
                    );

                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }
}

/// 重试助手函数
pub async fn retry_async<F, T, Fut>(operation: F, max_retries: u32) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T, ExchangeError>> + Send,
    T: Send,
{
    let policy = ExponentialBackoffRetry::new(RetryConfig {
        max_retries,
        ..Default::default()
    });

    policy.execute_with_retry(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_rate_limit_gets_longer_floor() {
        let policy = ExponentialBackoffRetry::new(RetryConfig {
            jitter: false,
            ..Default::default()
        });

        let transient = ExchangeError::TimeoutError {
            operation: "get_ticker".to_string(),
            timeout_seconds: 10,
        };
        let rate_limited = ExchangeError::RateLimitError("429".to_string(), None);

        let d1 = policy.calculate_delay(&transient, 0);
        let d2 = policy.calculate_delay(&rate_limited, 0);
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(2000));
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let policy = ExponentialBackoffRetry::new(RetryConfig::default());
        let auth = ExchangeError::AuthError("bad key".to_string());
        assert!(!policy.should_retry(&auth, 0));
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_after_transient_failures() {
        let policy = ExponentialBackoffRetry::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            jitter: false,
            ..Default::default()
        });

        let calls = AtomicU32::new(0);
        let result = policy
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExchangeError::TimeoutError {
                            operation: "test".to_string(),
                            timeout_seconds: 1,
                        })
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
