//! Feature flag 与延迟策略
//!
//! flag 通过 OpenFeature 远程评估协议（OFREP）从 flagd 获取，任何错误都按 0 处理。
//! `kafkaQueueProblems` 用于混沌测试：生产者据此重复发送，消费者据此人为放慢处理。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::FeatureFlagConfig;

/// 模拟队列积压的 flag
pub const QUEUE_PROBLEMS_FLAG: &str = "kafkaQueueProblems";

/// Feature flag 评估器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlagEvaluator: Send + Sync {
    /// 整数 flag 的取值，评估失败时返回 0
    async fn integer_flag(&self, name: &str) -> i64;
}

/// 根据配置选择评估器：配置了 OFREP 端点时远程评估，否则使用静态值
pub fn from_config(config: &FeatureFlagConfig) -> Arc<dyn FlagEvaluator> {
    let Some(endpoint) = config.ofrep_endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
        return Arc::new(StaticFlags::from_config(config));
    };

    match OfrepFlagClient::new(endpoint, Duration::from_millis(config.timeout_ms)) {
        Ok(client) => {
            info!(endpoint, "使用 OFREP 评估 feature flag");
            Arc::new(client)
        }
        Err(e) => {
            warn!(error = %e, "创建 OFREP 客户端失败，退回静态 flag");
            Arc::new(StaticFlags::from_config(config))
        }
    }
}

// ---------------------------------------------------------------------------
// OfrepFlagClient
// ---------------------------------------------------------------------------

/// OFREP 单 flag 评估客户端
pub struct OfrepFlagClient {
    client: reqwest::Client,
    endpoint: String,
}

impl OfrepFlagClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn evaluate_url(&self, name: &str) -> String {
        format!("{}/ofrep/v1/evaluate/flags/{name}", self.endpoint)
    }

    async fn evaluate(&self, name: &str) -> Result<i64, String> {
        let response = self
            .client
            .post(self.evaluate_url(name))
            .json(&json!({ "context": {} }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("OFREP 返回 {status}"));
        }

        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        integer_value(&body).ok_or_else(|| format!("flag 取值不是整数: {}", body["value"]))
    }
}

/// 从 OFREP 评估结果中取出整数值
fn integer_value(body: &Value) -> Option<i64> {
    let value = &body["value"];
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

#[async_trait]
impl FlagEvaluator for OfrepFlagClient {
    async fn integer_flag(&self, name: &str) -> i64 {
        match self.evaluate(name).await {
            Ok(value) => value,
            Err(e) => {
                debug!(flag = name, error = %e, "flag 评估失败，按 0 处理");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StaticFlags
// ---------------------------------------------------------------------------

/// 固定取值的 flag，未知 flag 为 0
#[derive(Debug, Clone, Default)]
pub struct StaticFlags {
    values: std::collections::HashMap<String, i64>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: i64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn from_config(config: &FeatureFlagConfig) -> Self {
        Self::new().with(QUEUE_PROBLEMS_FLAG, config.queue_problems)
    }
}

#[async_trait]
impl FlagEvaluator for StaticFlags {
    async fn integer_flag(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// DelayStrategy
// ---------------------------------------------------------------------------

/// 每条事件处理前的人为延迟
#[async_trait]
pub trait DelayStrategy: Send + Sync {
    /// 本条事件应等待的时长
    async fn delay(&self) -> Duration;

    /// 等待 `delay()` 返回的时长，返回实际等待时长
    async fn apply(&self) -> Duration {
        let delay = self.delay().await;
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "模拟队列积压，延迟处理");
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

/// 不延迟
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl DelayStrategy for NoDelay {
    async fn delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// 固定延迟
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl DelayStrategy for FixedDelay {
    async fn delay(&self) -> Duration {
        self.0
    }
}

/// flag 大于 0 时等待固定时长
pub struct FlagDelay {
    flags: Arc<dyn FlagEvaluator>,
    flag: String,
    delay: Duration,
}

impl FlagDelay {
    pub fn new(flags: Arc<dyn FlagEvaluator>, flag: &str, delay: Duration) -> Self {
        Self {
            flags,
            flag: flag.to_string(),
            delay,
        }
    }

    /// `kafkaQueueProblems` 大于 0 时延迟 1 秒
    pub fn queue_problems(flags: Arc<dyn FlagEvaluator>) -> Self {
        Self::new(flags, QUEUE_PROBLEMS_FLAG, Duration::from_secs(1))
    }
}

#[async_trait]
impl DelayStrategy for FlagDelay {
    async fn delay(&self) -> Duration {
        if self.flags.integer_flag(&self.flag).await > 0 {
            self.delay
        } else {
            Duration::ZERO
        }
    }
}
