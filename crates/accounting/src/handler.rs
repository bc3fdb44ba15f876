//! 订单事件处理器
//!
//! 每条事件：解码订单 -> 按延迟策略等待 -> 记录订单 -> 配置了存储时落库。
//! 解码和落库失败都只记录日志并计数，读取循环继续。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use orderbus_shared::eventhub::EventHandler;
use orderbus_shared::events::ReceivedEvent;
use orderbus_shared::feature_flags::{DelayStrategy, NoDelay};
use orderbus_shared::observability::metrics;
use tracing::{error, info};

use crate::error::AccountingError;
use crate::models::{display_cost, normalize};
use crate::store::OrderStore;

pub const SERVICE_NAME: &str = "accounting";

/// 单条事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 未配置数据库，只记录日志
    Logged,
    Persisted,
}

/// 处理计数
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub received: AtomicU64,
    pub persisted: AtomicU64,
    pub failed: AtomicU64,
}

impl HandlerStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct AccountingHandler {
    store: Option<Arc<dyn OrderStore>>,
    delay: Arc<dyn DelayStrategy>,
    stats: HandlerStats,
}

impl AccountingHandler {
    /// `store` 为 `None` 时只记录订单不落库
    pub fn new(store: Option<Arc<dyn OrderStore>>, delay: Arc<dyn DelayStrategy>) -> Self {
        Self {
            store,
            delay,
            stats: HandlerStats::default(),
        }
    }

    pub fn log_only() -> Self {
        Self::new(None, Arc::new(NoDelay))
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    pub async fn process(&self, event: &ReceivedEvent) -> Result<Outcome, AccountingError> {
        let order = event
            .decode_order()
            .map_err(|e| AccountingError::Decode(e.to_string()))?;

        self.delay.apply().await;
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        info!(
            order_id = %order.order_id,
            items = order.items.len(),
            shipping_tracking_id = %order.shipping_tracking_id,
            shipping_cost = %display_cost(order.shipping_cost.as_ref()),
            "订单已接收"
        );

        let Some(store) = &self.store else {
            return Ok(Outcome::Logged);
        };

        store.save(&normalize(&order)).await?;
        self.stats.persisted.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::Persisted)
    }
}

#[async_trait]
impl EventHandler for AccountingHandler {
    async fn handle(&self, event: ReceivedEvent) {
        match self.process(&event).await {
            Ok(Outcome::Persisted) => metrics::record_order_processed(SERVICE_NAME, "persisted"),
            Ok(Outcome::Logged) => metrics::record_order_processed(SERVICE_NAME, "logged"),
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    partition = event.partition,
                    offset = event.offset,
                    error = %e,
                    "订单事件处理失败，跳过"
                );
                metrics::record_order_processed(SERVICE_NAME, e.status());
            }
        }
    }
}
