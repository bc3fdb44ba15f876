//! 订单事件处理器
//!
//! 每条事件：解码订单 -> 按延迟策略等待 -> 计数 + 记录日志。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use orderbus_shared::eventhub::EventHandler;
use orderbus_shared::events::ReceivedEvent;
use orderbus_shared::feature_flags::{DelayStrategy, NoDelay};
use orderbus_shared::observability::metrics;
use tracing::{error, info};

use crate::error::FraudError;

pub const SERVICE_NAME: &str = "fraud-detection";

/// 欺诈检测处理器
///
/// 计数器由外部注入，便于在进程内其他位置读取已处理的订单数。
pub struct FraudDetectionHandler {
    counter: Arc<AtomicU64>,
    delay: Arc<dyn DelayStrategy>,
}

impl FraudDetectionHandler {
    pub fn new(counter: Arc<AtomicU64>, delay: Arc<dyn DelayStrategy>) -> Self {
        Self { counter, delay }
    }

    /// 不延迟、使用独立计数器
    pub fn without_delay() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)), Arc::new(NoDelay))
    }

    /// 已处理的订单数
    pub fn processed(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// 处理一条事件，返回累计订单数
    pub async fn process(&self, event: &ReceivedEvent) -> Result<u64, FraudError> {
        let order = event
            .decode_order()
            .map_err(|e| FraudError::Decode(e.to_string()))?;

        self.delay.apply().await;

        let total = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            order_id = %order.order_id,
            items = order.items.len(),
            partition = event.partition,
            offset = event.offset,
            total,
            "订单已接收"
        );
        Ok(total)
    }
}

#[async_trait]
impl EventHandler for FraudDetectionHandler {
    async fn handle(&self, event: ReceivedEvent) {
        match self.process(&event).await {
            Ok(_) => metrics::record_order_processed(SERVICE_NAME, "processed"),
            Err(e) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use orderbus_shared::test_utils::test_order;
    use std::collections::HashMap;
    use std::time::Duration;

    mock! {
        Delay {}

        #[async_trait]
        impl DelayStrategy for Delay {
            async fn delay(&self) -> Duration;
        }
    }

    fn received(offset: i64, body: Vec<u8>) -> ReceivedEvent {
        ReceivedEvent {
            channel: "orders".to_string(),
            partition: 0,
            offset,
            partition_key: None,
            body,
            enqueued_at: None,
            properties: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_counts_decoded_orders() {
        let counter = Arc::new(AtomicU64::new(0));
        let handler = FraudDetectionHandler::new(counter.clone(), Arc::new(NoDelay));

        assert_eq!(handler.process(&received(0, test_order("o-1").to_bytes())).await.unwrap(), 1);
        assert_eq!(handler.process(&received(1, test_order("o-2").to_bytes())).await.unwrap(), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let mut delay = MockDelay::new();
        // 解码失败时不应进入延迟
        delay.expect_delay().times(0);
        let handler =
            FraudDetectionHandler::new(Arc::new(AtomicU64::new(0)), Arc::new(delay));

        let err = handler
            .process(&received(0, vec![0x0a, 0x7f, 0x01]))
            .await
            .unwrap_err();
        assert!(matches!(err, FraudError::Decode(_)));

        handler.handle(received(1, vec![0xff, 0xff])).await;
        assert_eq!(handler.processed(), 0);
    }

    #[tokio::test]
    async fn test_delay_consulted_per_event() {
        let mut delay = MockDelay::new();
        delay
            .expect_delay()
            .times(3)
            .returning(|| Duration::from_millis(1));
        let handler = FraudDetectionHandler::new(Arc::new(AtomicU64::new(0)), Arc::new(delay));

        for i in 0..3 {
            handler.handle(received(i, test_order("o").to_bytes())).await;
        }
        assert_eq!(handler.processed(), 3);
    }
}
