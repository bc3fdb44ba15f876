//! 退避重试
//!
//! 生产者本身只发送一次。调用方选择重试时，用 `RetryPolicy::run` 包装操作，
//! 只有实现 `Retryable` 且判定为瞬时故障的错误才会重试。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::EventBusError;

/// 能判断自身是否为瞬时故障的错误
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for EventBusError {
    fn is_retryable(&self) -> bool {
        EventBusError::is_retryable(self)
    }
}

/// 指数退避策略
///
/// 第 n 次重试前等待 `initial_delay * multiplier^n`，不超过 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次尝试之外最多再试几次
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::with_max_retries(0)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 第 `retry` 次重试（从 0 开始）前的等待时间
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let scaled_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        Duration::from_millis(scaled_ms.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// 已重试 `retries` 次后是否还能再试
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// 执行 `operation`，对瞬时故障按策略退避重试
    ///
    /// 不可重试的错误和最后一次失败原样返回。
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        info!(operation = operation_name, retries, "重试后成功");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || !self.should_retry(retries) {
                warn!(
                    operation = operation_name,
                    retries,
                    retryable = err.is_retryable(),
                    error = %err,
                    "操作失败，不再重试"
                );
                return Err(err);
            }

            let delay = self.delay_for_attempt(retries);
            warn!(
                operation = operation_name,
                retry = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "操作失败，退避后重试"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}
