//! 订单事件发布器
//!
//! 每个订单编码后只发布一次；调用方可通过 `publish_retries` 选择对可重试错误做指数退避重试。
//! `kafkaQueueProblems` 大于 0 时额外并发发送 n 份副本制造队列积压，副本失败只记录日志。

use std::sync::Arc;

use futures::future::join_all;
use order_proto::OrderResult;
use orderbus_shared::config::PublishConfig;
use orderbus_shared::eventhub::EventProducer;
use orderbus_shared::feature_flags::{FlagEvaluator, QUEUE_PROBLEMS_FLAG};
use orderbus_shared::retry::RetryPolicy;
use tracing::{info, instrument, warn};

use crate::error::CheckoutError;

/// 单次发布最多附带的副本数
pub const MAX_EXTRA_COPIES: i64 = 100;

pub struct OrderPublisher {
    producer: Arc<EventProducer>,
    flags: Arc<dyn FlagEvaluator>,
    retry: RetryPolicy,
}

impl OrderPublisher {
    /// 默认只尝试一次
    pub fn new(producer: Arc<EventProducer>, flags: Arc<dyn FlagEvaluator>) -> Self {
        Self {
            producer,
            flags,
            retry: RetryPolicy::no_retry(),
        }
    }

    pub fn from_config(
        producer: Arc<EventProducer>,
        flags: Arc<dyn FlagEvaluator>,
        config: &PublishConfig,
    ) -> Self {
        Self::new(producer, flags).with_retry(RetryPolicy::with_max_retries(config.publish_retries))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 编码并发布一个订单
    #[instrument(skip_all, fields(order_id = %order.order_id))]
    pub async fn publish_order(&self, order: &OrderResult) -> Result<(), CheckoutError> {
        let payload = order.to_bytes();
        self.publish_payload(&payload).await?;
        info!(
            order_id = %order.order_id,
            items = order.items.len(),
            "订单事件已发布"
        );
        Ok(())
    }

    /// 发布已序列化的负载
    pub async fn publish_payload(&self, payload: &[u8]) -> Result<(), CheckoutError> {
        self.retry
            .run("publish_order", || async move {
                self.producer.publish(payload).await.map_err(CheckoutError::from)
            })
            .await?;

        self.overload_queue(payload).await;
        Ok(())
    }

    /// 按 flag 取值并发发送额外副本，返回成功发送的副本数
    async fn overload_queue(&self, payload: &[u8]) -> usize {
        let requested = self.flags.integer_flag(QUEUE_PROBLEMS_FLAG).await;
        if requested <= 0 {
            return 0;
        }

        let copies = requested.min(MAX_EXTRA_COPIES);
        if copies < requested {
            warn!(requested, max = MAX_EXTRA_COPIES, "副本数超过上限，已截断");
        }
        warn!(flag = QUEUE_PROBLEMS_FLAG, copies, "模拟队列问题，额外发送订单副本");

        let sends = (0..copies).map(|_| self.producer.publish(payload));
        let results = join_all(sends).await;

        let mut sent = 0;
        for result in results {
            match result {
                Ok(()) => sent += 1,
                Err(e) => warn!(error = %e, "订单副本发送失败"),
            }
        }
        sent
    }

    /// 关闭底层生产者
    pub async fn shutdown(&self) {
        self.producer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderbus_shared::error::EventBusError;
    use orderbus_shared::feature_flags::StaticFlags;
    use orderbus_shared::retry::Retryable;
    use orderbus_shared::test_utils::{InMemoryChannel, test_order, test_order_id};
    use std::time::Duration;

    fn publisher(channel: &InMemoryChannel, queue_problems: i64) -> OrderPublisher {
        let producer = EventProducer::with_sender(channel.sender(), channel.name(), 1_048_576);
        let flags = StaticFlags::new().with(QUEUE_PROBLEMS_FLAG, queue_problems);
        OrderPublisher::new(Arc::new(producer), Arc::new(flags))
    }

    #[tokio::test]
    async fn test_publish_order_sends_single_event() {
        let channel = InMemoryChannel::new("orders", 2);
        let publisher = publisher(&channel, 0);
        let order = test_order(&test_order_id());

        publisher.publish_order(&order).await.unwrap();

        assert_eq!(channel.len(), 1);
        let event = channel
            .events(0)
            .into_iter()
            .chain(channel.events(1))
            .next()
            .unwrap();
        assert_eq!(event.decode_order().unwrap(), order);
    }

    #[tokio::test]
    async fn test_queue_problems_sends_extra_copies() {
        let channel = InMemoryChannel::new("orders", 4);
        let publisher = publisher(&channel, 3);

        publisher.publish_order(&test_order("order-dup")).await.unwrap();

        assert_eq!(channel.len(), 4);
    }

    #[tokio::test]
    async fn test_extra_copies_are_capped() {
        let channel = InMemoryChannel::new("orders", 4);
        let publisher = publisher(&channel, i64::MAX);

        let sent = publisher.overload_queue(b"payload").await;

        assert_eq!(sent, MAX_EXTRA_COPIES as usize);
        assert_eq!(channel.len(), MAX_EXTRA_COPIES as usize);
    }

    #[tokio::test]
    async fn test_failed_copies_do_not_fail_publish() {
        let channel = InMemoryChannel::new("orders", 1);
        let publisher = publisher(&channel, 2);

        channel.fail_next_publish(EventBusError::Publish("throttled".into()));
        let sent = publisher.overload_queue(b"payload").await;

        assert_eq!(sent, 1);
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let channel = InMemoryChannel::new("orders", 1);
        let publisher = publisher(&channel, 0);
        channel.fail_next_publish(EventBusError::Publish("throttled".into()));

        let err = publisher.publish_order(&test_order("order-1")).await.unwrap_err();

        assert!(matches!(err, CheckoutError::EventBus(EventBusError::Publish(_))));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let channel = InMemoryChannel::new("orders", 1);
        let publisher = publisher(&channel, 0).with_retry(RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        });
        channel.fail_next_publish(EventBusError::Publish("throttled".into()));

        publisher.publish_order(&test_order("order-1")).await.unwrap();

        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_producer_is_not_retried() {
        let channel = InMemoryChannel::new("orders", 1);
        let publisher = publisher(&channel, 0).with_retry(RetryPolicy::with_max_retries(5));
        publisher.shutdown().await;

        let err = publisher.publish_order(&test_order("order-1")).await.unwrap_err();

        assert!(matches!(err, CheckoutError::EventBus(EventBusError::Closed)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_config_uses_publish_retries() {
        let channel = InMemoryChannel::new("orders", 1);
        let producer = EventProducer::with_sender(channel.sender(), channel.name(), 1_048_576);
        let publisher = OrderPublisher::from_config(
            Arc::new(producer),
            Arc::new(StaticFlags::new()),
            &PublishConfig { publish_retries: 4 },
        );
        assert_eq!(publisher.retry.max_retries, 4);
    }
}
