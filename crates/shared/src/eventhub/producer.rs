//! 事件生产者
//!
//! 每次 `publish` 把负载包装为一个事件、放入只含一个事件的批次并同步发送，
//! broker 确认后才返回成功。生产者内部不重试，由调用方决定重试、降级还是向上传播。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, instrument};

use super::EventSender;
use super::credential::CredentialSource;
use super::kafka::KafkaEventSender;
use crate::config::EventHubConfig;
use crate::error::EventBusError;
use crate::events::{EventData, EventDataBatch};
use crate::observability::{metrics, tracing as otel};

/// 绑定到单个 channel 的事件生产者
pub struct EventProducer {
    sender: Arc<dyn EventSender>,
    channel: String,
    max_batch_bytes: usize,
    closed: AtomicBool,
}

impl EventProducer {
    /// 校验配置后连接 EventHub
    ///
    /// 命名空间缺失时在任何网络调用之前返回 `Configuration` 错误。
    pub async fn connect(config: &EventHubConfig) -> Result<Self, EventBusError> {
        config.validate()?;
        let credential = CredentialSource::from_config(config)?;
        let sender = KafkaEventSender::connect(config, &credential).await?;

        info!(
            namespace = %config.fully_qualified_namespace(),
            eventhub = %config.name,
            "EventHub 生产者已初始化"
        );
        Ok(Self::with_sender(
            Arc::new(sender),
            &config.name,
            config.max_batch_bytes,
        ))
    }

    /// 使用自定义传输创建生产者
    pub fn with_sender(
        sender: Arc<dyn EventSender>,
        channel: impl Into<String>,
        max_batch_bytes: usize,
    ) -> Self {
        Self {
            sender,
            channel: channel.into(),
            max_batch_bytes,
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 发布一段已序列化的负载
    pub async fn publish(&self, payload: &[u8]) -> Result<(), EventBusError> {
        self.publish_event(EventData::new(payload)).await
    }

    /// 发布一个事件（批次大小为 1，单次发送）
    #[instrument(skip_all, fields(eventhub = %self.channel, message_size = event.body.len()))]
    pub async fn publish_event(&self, mut event: EventData) -> Result<(), EventBusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        otel::inject_to_properties(&mut event.properties);
        let message_size = event.body.len();

        let mut batch = EventDataBatch::new(self.max_batch_bytes);
        if let Err(e) = batch.try_add(event) {
            error!(error = %e, "事件超出批次上限");
            metrics::record_event_published(&self.channel, false, message_size);
            return Err(e);
        }

        match self.sender.send_batch(batch).await {
            Ok(()) => {
                info!(
                    eventhub = %self.channel,
                    message_size,
                    "事件已发送到 EventHub"
                );
                metrics::record_event_published(&self.channel, true, message_size);
                Ok(())
            }
            Err(e) => {
                error!(eventhub = %self.channel, message_size, error = %e, "事件发送失败");
                metrics::record_event_published(&self.channel, false, message_size);
                Err(e)
            }
        }
    }

    /// 释放连接；可重复调用
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.close().await;
        info!(eventhub = %self.channel, "EventHub 生产者已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Sender {}

        #[async_trait]
        impl EventSender for Sender {
            async fn send_batch(&self, batch: EventDataBatch) -> Result<(), EventBusError>;
            async fn close(&self);
        }
    }

    #[tokio::test]
    async fn test_publish_sends_single_event_batch() {
        let mut sender = MockSender::new();
        sender
            .expect_send_batch()
            .withf(|batch| batch.len() == 1 && batch.events()[0].body == b"order-1")
            .times(1)
            .returning(|_| Ok(()));

        let producer = EventProducer::with_sender(Arc::new(sender), "orders", 1024);
        producer.publish(b"order-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_does_not_retry() {
        let mut sender = MockSender::new();
        sender
            .expect_send_batch()
            .times(1)
            .returning(|_| Err(EventBusError::Publish("throttled".to_string())));

        let producer = EventProducer::with_sender(Arc::new(sender), "orders", 1024);
        let err = producer.publish(b"order-1").await.unwrap_err();
        assert_eq!(err.code(), "PUBLISH_ERROR");
    }

    #[tokio::test]
    async fn test_publish_oversized_event() {
        let mut sender = MockSender::new();
        sender.expect_send_batch().never();

        let producer = EventProducer::with_sender(Arc::new(sender), "orders", 8);
        let err = producer.publish(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, EventBusError::EventTooLarge { size: 16, max: 8 }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut sender = MockSender::new();
        sender.expect_close().times(1).returning(|| ());
        sender.expect_send_batch().never();

        let producer = EventProducer::with_sender(Arc::new(sender), "orders", 1024);
        producer.shutdown().await;
        producer.shutdown().await;

        let err = producer.publish(b"late").await.unwrap_err();
        assert!(matches!(err, EventBusError::Closed));
    }

    #[tokio::test]
    async fn test_connect_without_namespace_fails_before_network() {
        let config = EventHubConfig::default();
        let err = EventProducer::connect(&config).await.err().unwrap();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_publish_event_keeps_properties() {
        let mut sender = MockSender::new();
        sender
            .expect_send_batch()
            .withf(|batch| {
                let event = &batch.events()[0];
                event.partition_key.as_deref() == Some("user-1")
                    && event.properties.get("content-type").map(String::as_str)
                        == Some("application/x-protobuf")
            })
            .times(1)
            .returning(|_| Ok(()));

        let producer = EventProducer::with_sender(Arc::new(sender), "orders", 1024);
        producer
            .publish_event(
                EventData::new(b"order".to_vec())
                    .with_partition_key("user-1")
                    .with_property("content-type", "application/x-protobuf"),
            )
            .await
            .unwrap();
    }
}
