use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};
use tokio::time::sleep;

use crate::core::error::ExchangeError;

/// 限流器（带自适应降速）
///
/// 交易所的REST配额是对账、下单、行情查询共享的资源，所有REST调用
/// 都必须先 acquire，避免某一个消费方把其他消费方饿死。
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    base_requests_per_second: u32,
    current_delay_ms: Arc<AtomicU64>,
    request_times: Arc<RwLock<Vec<Instant>>>,
    last_error_time: Arc<RwLock<Option<Instant>>>,
    error_count: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(requests_per_second.max(1) as usize)),
            base_requests_per_second: requests_per_second.max(1),
            current_delay_ms: Arc::new(AtomicU64::new(0)),
            request_times: Arc::new(RwLock::new(Vec::new())),
            last_error_time: Arc::new(RwLock::new(None)),
            error_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 报告请求错误（触发自适应降速）
    pub async fn report_error(&self) {
        let error_count = self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut last_error = self.last_error_time.write().await;
        *last_error = Some(Instant::now());

        // 指数级增加延迟
        let current_delay = self.current_delay_ms.load(Ordering::Relaxed);
        let new_delay = if current_delay == 0 {
            100
        } else {
            (current_delay * 2).min(5000)
        };
        self.current_delay_ms.store(new_delay, Ordering::Relaxed);

        log::warn!(
            "请求错误，增加延迟到 {}ms (错误次数: {})",
            new_delay,
            error_count + 1
        );
    }

    /// 检查是否可以恢复正常速度
    pub async fn try_recover(&self) {
        let last_error = self.last_error_time.read().await;
        if let Some(time) = *last_error {
            // 30秒无错误则逐步恢复
            if time.elapsed() > Duration::from_secs(30) {
                let current_delay = self.current_delay_ms.load(Ordering::Relaxed);
                if current_delay > 0 {
                    let new_delay = current_delay / 2;
                    self.current_delay_ms.store(new_delay, Ordering::Relaxed);
                    if new_delay == 0 {
                        self.error_count.store(0, Ordering::Relaxed);
                        log::info!("请求限流已恢复正常");
                    } else {
                        log::info!("减少请求延迟到 {}ms", new_delay);
                    }
                }
            }
        }
    }

    /// 等待直到可以发送请求
    pub async fn acquire(&self) -> Result<(), ExchangeError> {
        // 先应用自适应延迟
        let delay_ms = self.current_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }

        self.try_recover().await;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ExchangeError::Other(format!("限流器错误: {}", e)))?;

        // 清理旧的请求记录，滚动1秒窗口
        let mut times = self.request_times.write().await;
        let now = Instant::now();
        times.retain(|t| now.duration_since(*t) < Duration::from_secs(1));

        while times.len() >= self.base_requests_per_second as usize {
            sleep(Duration::from_millis(100)).await;
            let now = Instant::now();
            times.retain(|t| now.duration_since(*t) < Duration::from_secs(1));
        }

        times.push(Instant::now());
        Ok(())
    }
}
