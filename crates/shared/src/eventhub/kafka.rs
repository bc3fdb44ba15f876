//! EventHub 的 Kafka 协议端点传输实现
//!
//! EventHub 命名空间在 9093 端口提供 Kafka 兼容端点：EventHub 实体即 topic，
//! 消费组即 group，分区与偏移量语义一致。这里用 rdkafka 实现 `EventSender` / `EventSource`，
//! 统一认证、错误映射和分区拆分，服务代码只依赖上层抽象。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rdkafka::client::{ClientContext, OAuthToken};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::credential::{CredentialSource, ManagedIdentityCredential};
use super::{EventSender, EventSource, PartitionReceiver, StartPosition};
use crate::config::EventHubConfig;
use crate::error::EventBusError;
use crate::events::{EventData, EventDataBatch, ReceivedEvent};

// ---------------------------------------------------------------------------
// 客户端配置
// ---------------------------------------------------------------------------

/// 连接串认证时 SASL PLAIN 的固定用户名
const CONNECTION_STRING_USERNAME: &str = "$ConnectionString";

/// 构建生产者与消费者共用的客户端配置
pub(crate) fn base_client_config(
    config: &EventHubConfig,
    credential: &CredentialSource,
    client_id: &str,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", client_id)
        .set(
            "socket.connection.setup.timeout.ms",
            config.connect_timeout_ms.to_string(),
        );
    apply_credential(&mut client_config, &config.security_protocol, credential);
    client_config
}

/// 按安全协议设置 SASL 参数；PLAINTEXT / SSL（本地 Kafka）不做 SASL 认证
pub(crate) fn apply_credential(
    client_config: &mut ClientConfig,
    security_protocol: &str,
    credential: &CredentialSource,
) {
    client_config.set("security.protocol", security_protocol);

    let protocol = security_protocol.to_ascii_uppercase();
    if !protocol.starts_with("SASL") {
        return;
    }

    client_config.set("sasl.mechanism", credential.sasl_mechanism());
    if let CredentialSource::ConnectionString(conn) = credential {
        client_config
            .set("sasl.username", CONNECTION_STRING_USERNAME)
            .set("sasl.password", conn.as_sasl_password());
    }
}

// ---------------------------------------------------------------------------
// EventHubContext
// ---------------------------------------------------------------------------

/// rdkafka 客户端上下文
///
/// 负责把 librdkafka 的日志与错误转为 tracing 事件，托管身份认证时按需签发 OAUTHBEARER 令牌。
pub struct EventHubContext {
    role: &'static str,
    identity: Option<ManagedIdentityCredential>,
}

impl EventHubContext {
    pub fn new(role: &'static str, credential: &CredentialSource) -> Self {
        let identity = match credential {
            CredentialSource::ManagedIdentity(cred) => Some(cred.clone()),
            CredentialSource::ConnectionString(_) => None,
        };
        Self { role, identity }
    }
}

impl ClientContext for EventHubContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(role = self.role, facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Warning => {
                warn!(role = self.role, facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(role = self.role, facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Debug => {
                debug!(role = self.role, facility = fac, "librdkafka: {log_message}")
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(role = self.role, error = %error, reason, "EventHub 客户端错误");
    }

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> Result<OAuthToken, Box<dyn std::error::Error>> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            EventBusError::Credential("未配置托管身份，无法签发 OAUTHBEARER 令牌".to_string())
        })?;

        let token = identity.fetch_token().inspect_err(|e| {
            error!(role = self.role, error = %e, "获取托管身份令牌失败");
        })?;

        debug!(role = self.role, expires_on_ms = token.expires_on_ms, "OAUTHBEARER 令牌已刷新");
        Ok(OAuthToken {
            token: token.token,
            principal_name: identity.principal_name().to_string(),
            lifetime_ms: token.expires_on_ms,
        })
    }
}

impl ConsumerContext for EventHubContext {
    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(role = self.role, error = %e, "提交消费位点失败");
        }
    }
}

// ---------------------------------------------------------------------------
// 错误映射
// ---------------------------------------------------------------------------

/// 认证被拒、授权被撤销或 topic 不存在时，继续轮询没有意义
fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::Fatal
    )
}

/// 将接收端的 Kafka 错误映射为事件总线错误
pub(crate) fn map_kafka_error(err: &KafkaError) -> EventBusError {
    let fatal = matches!(err, KafkaError::MessageConsumptionFatal(_))
        || err.rdkafka_error_code().is_some_and(is_fatal_code);
    if fatal {
        EventBusError::FatalTransport(err.to_string())
    } else {
        EventBusError::Receive(err.to_string())
    }
}

/// 从元数据中找出 topic 的分区列表
fn partitions_from_metadata(metadata: &Metadata, topic: &str) -> Result<Vec<i32>, EventBusError> {
    let entry = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .ok_or_else(|| EventBusError::Connection(format!("EventHub '{topic}' 不存在")))?;

    if let Some(err) = entry.error() {
        return Err(EventBusError::Connection(format!(
            "EventHub '{topic}' 元数据错误: {:?}",
            RDKafkaErrorCode::from(err)
        )));
    }

    let mut partitions: Vec<i32> = entry.partitions().iter().map(|p| p.id()).collect();
    partitions.sort_unstable();
    Ok(partitions)
}

/// 将借用消息转换为拥有所有权的事件
fn received_from_borrowed(channel: &str, msg: &BorrowedMessage<'_>) -> ReceivedEvent {
    let partition_key = msg
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .map(String::from);

    let mut properties = HashMap::new();
    if let Some(headers) = msg.headers() {
        for idx in 0..headers.count() {
            let header = headers.get(idx);
            if let Some(Ok(value)) = header.value.map(std::str::from_utf8) {
                properties.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    ReceivedEvent {
        channel: channel.to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        partition_key,
        body: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        enqueued_at: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        properties,
    }
}

fn to_kafka_offset(position: StartPosition) -> Offset {
    match position {
        StartPosition::Earliest => Offset::Beginning,
        StartPosition::Latest => Offset::End,
        StartPosition::Committed => Offset::Stored,
        StartPosition::Offset(n) => Offset::Offset(n),
    }
}

// ---------------------------------------------------------------------------
// KafkaEventSender
// ---------------------------------------------------------------------------

/// 基于 `FutureProducer` 的发送端
pub struct KafkaEventSender {
    producer: FutureProducer<EventHubContext>,
    topic: String,
    publish_timeout: Duration,
}

impl KafkaEventSender {
    /// 创建生产者并通过一次元数据请求确认端点、凭据与 channel 可用
    pub async fn connect(
        config: &EventHubConfig,
        credential: &CredentialSource,
    ) -> Result<Self, EventBusError> {
        let producer: FutureProducer<EventHubContext> =
            base_client_config(config, credential, "orderbus-producer")
                .set("message.timeout.ms", config.publish_timeout_ms.to_string())
                .set("acks", "all")
                .create_with_context(EventHubContext::new("producer", credential))
                .map_err(|e| EventBusError::Connection(format!("创建生产者失败: {e}")))?;

        let probe = producer.clone();
        let topic = config.name.clone();
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let partitions = tokio::task::spawn_blocking(move || {
            let metadata = probe
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| EventBusError::Connection(format!("连接 EventHub 失败: {e}")))?;
            partitions_from_metadata(&metadata, &topic)
        })
        .await
        .map_err(|e| EventBusError::Internal(format!("元数据任务异常: {e}")))??;
        info!(
            bootstrap = %config.bootstrap_servers(),
            eventhub = %config.name,
            partitions = partitions.len(),
            "EventHub 生产者已连接"
        );

        Ok(Self {
            producer,
            topic: config.name.clone(),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }

    async fn send_one(&self, event: &EventData) -> Result<(), EventBusError> {
        let mut headers = OwnedHeaders::new_with_capacity(event.properties.len());
        for (key, value) in &event.properties {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(&self.topic)
            .payload(event.body.as_slice())
            .headers(headers);
        if let Some(key) = event.partition_key.as_deref() {
            record = record.key(key);
        }
        if let Some(created_at) = event.created_at {
            record = record.timestamp(created_at.timestamp_millis());
        }

        let delivery = self
            .producer
            .send(record, self.publish_timeout)
            .await
            .map_err(|(e, _)| EventBusError::Publish(format!("发送事件失败: {e}")))?;

        debug!(
            eventhub = %self.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "事件已确认"
        );
        Ok(())
    }
}

#[async_trait]
impl EventSender for KafkaEventSender {
    async fn send_batch(&self, batch: EventDataBatch) -> Result<(), EventBusError> {
        let events = batch.into_events();
        futures::future::try_join_all(events.iter().map(|event| self.send_one(event))).await?;
        Ok(())
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.publish_timeout;
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => info!(eventhub = %self.topic, "EventHub 生产者已关闭"),
            Ok(Err(e)) => warn!(error = %e, "关闭前刷新待发送事件失败"),
            Err(e) => warn!(error = %e, "刷新任务异常"),
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaEventSource
// ---------------------------------------------------------------------------

type EventHubConsumer = StreamConsumer<EventHubContext>;

/// 基于 `StreamConsumer` 的接收端
///
/// 每个分区拆分出独立队列，由各自的读取任务消费；主队列由后台驱动任务轮询，
/// 用于处理回调（包括 OAUTHBEARER 令牌刷新）并发现致命错误。
pub struct KafkaEventSource {
    consumer: Arc<EventHubConsumer>,
    topic: String,
    partitions: Vec<i32>,
    fatal: Arc<watch::Sender<Option<String>>>,
    driver: Mutex<Option<MainQueueDriver>>,
}

/// 消费者配置：自动提交已存储的位点，位点只在 handler 处理完成后由 ack 存储
fn consumer_client_config(config: &EventHubConfig, credential: &CredentialSource) -> ClientConfig {
    let mut client_config = base_client_config(config, credential, "orderbus-consumer");
    client_config
        .set("group.id", &config.consumer_group)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false");
    client_config
}

impl KafkaEventSource {
    /// 创建消费者，确认 channel 存在并缓存分区列表
    pub async fn connect(
        config: &EventHubConfig,
        credential: &CredentialSource,
    ) -> Result<Self, EventBusError> {
        let consumer: EventHubConsumer = consumer_client_config(config, credential)
            .create_with_context(EventHubContext::new("consumer", credential))
            .map_err(|e| EventBusError::Connection(format!("创建消费者失败: {e}")))?;
        let consumer = Arc::new(consumer);

        // 令牌刷新事件只在轮询消费者时处理，驱动任务必须先于元数据请求启动
        let fatal = Arc::new(watch::channel(None).0);
        let driver = MainQueueDriver::spawn(|stop| {
            drive_main_queue(Arc::clone(&consumer), stop, Arc::clone(&fatal))
        });

        let probe = Arc::clone(&consumer);
        let topic = config.name.clone();
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let (driver, partitions) = driver
            .probe(async move {
                tokio::task::spawn_blocking(move || {
                    let metadata = probe.fetch_metadata(Some(&topic), timeout).map_err(|e| {
                        EventBusError::Connection(format!("连接 EventHub 失败: {e}"))
                    })?;
                    partitions_from_metadata(&metadata, &topic)
                })
                .await
                .map_err(|e| EventBusError::Internal(format!("元数据任务异常: {e}")))?
            })
            .await?;

        if partitions.is_empty() {
            driver.shutdown().await;
            return Err(EventBusError::FatalTransport(format!(
                "EventHub '{}' 没有可读取的分区",
                config.name
            )));
        }
        info!(
            bootstrap = %config.bootstrap_servers(),
            eventhub = %config.name,
            consumer_group = %config.consumer_group,
            partitions = ?partitions,
            "EventHub 消费者已连接"
        );

        Ok(Self {
            consumer,
            topic: config.name.clone(),
            partitions,
            fatal,
            driver: Mutex::new(Some(driver)),
        })
    }
}

/// 主队列驱动任务
struct MainQueueDriver {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MainQueueDriver {
    fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(make(stop_rx));
        Self { stop, handle }
    }

    /// 在驱动任务运行期间执行连接探测；探测失败时先停止驱动任务再返回错误
    async fn probe<T, Fut>(self, probe: Fut) -> Result<(Self, T), EventBusError>
    where
        Fut: Future<Output = Result<T, EventBusError>>,
    {
        match probe.await {
            Ok(value) => Ok((self, value)),
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "主队列驱动任务异常退出");
        }
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn partition_ids(&self) -> Result<Vec<i32>, EventBusError> {
        Ok(self.partitions.clone())
    }

    async fn open_partitions(
        &self,
        partitions: &[i32],
        position: StartPosition,
    ) -> Result<Vec<Box<dyn PartitionReceiver>>, EventBusError> {
        // 拆分必须先于分配，否则消息会进入主队列
        let mut receivers: Vec<Box<dyn PartitionReceiver>> = Vec::with_capacity(partitions.len());
        let mut assignment = TopicPartitionList::new();
        for &partition in partitions {
            let queue = self
                .consumer
                .split_partition_queue(&self.topic, partition)
                .ok_or_else(|| {
                    EventBusError::Internal(format!("无法拆分分区队列: partition={partition}"))
                })?;
            assignment
                .add_partition_offset(&self.topic, partition, to_kafka_offset(position))
                .map_err(|e| EventBusError::Internal(format!("构建分区分配失败: {e}")))?;
            receivers.push(Box::new(KafkaPartitionReceiver {
                consumer: Arc::clone(&self.consumer),
                channel: self.topic.clone(),
                partition,
                queue,
                fatal: self.fatal.subscribe(),
            }));
        }

        self.consumer
            .assign(&assignment)
            .map_err(|e| EventBusError::Connection(format!("分配分区失败: {e}")))?;
        info!(eventhub = %self.topic, %position, count = partitions.len(), "分区已分配");
        Ok(receivers)
    }

    async fn close(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.shutdown().await;
        }
        if let Err(e) = self.consumer.unassign() {
            debug!(error = %e, "取消分区分配失败");
        }
        info!(eventhub = %self.topic, "EventHub 消费者已关闭");
    }
}

// ---------------------------------------------------------------------------
// KafkaPartitionReceiver
// ---------------------------------------------------------------------------

/// 单个分区的接收器
pub struct KafkaPartitionReceiver {
    consumer: Arc<EventHubConsumer>,
    channel: String,
    partition: i32,
    queue: StreamPartitionQueue<EventHubContext>,
    fatal: watch::Receiver<Option<String>>,
}

#[async_trait]
impl PartitionReceiver for KafkaPartitionReceiver {
    fn partition_id(&self) -> i32 {
        self.partition
    }

    async fn recv(&mut self) -> Result<ReceivedEvent, EventBusError> {
        loop {
            if let Some(reason) = self.fatal.borrow_and_update().clone() {
                return Err(EventBusError::FatalTransport(reason));
            }

            tokio::select! {
                changed = self.fatal.changed() => {
                    if changed.is_err() {
                        return Err(EventBusError::FatalTransport(
                            "EventHub 消费者已释放".to_string(),
                        ));
                    }
                }
                msg = self.queue.recv() => {
                    return msg
                        .map(|m| received_from_borrowed(&self.channel, &m))
                        .map_err(|e| map_kafka_error(&e));
                }
            }
        }
    }

    fn ack(&mut self, offset: i64) -> Result<(), EventBusError> {
        // rd_kafka_offset_store 自行加一，提交的是下一条待读取的位置
        self.consumer
            .store_offset(&self.channel, self.partition, offset)
            .map_err(|e| EventBusError::Receive(format!("存储消费位点失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventhub::credential::ConnectionString;

    fn config() -> EventHubConfig {
        EventHubConfig {
            namespace: "otel-ns".to_string(),
            ..Default::default()
        }
    }

    fn connection_string() -> CredentialSource {
        CredentialSource::ConnectionString(
            ConnectionString::parse(
                "Endpoint=sb://otel-ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=a2V5",
            )
            .unwrap(),
        )
    }

    fn managed_identity() -> CredentialSource {
        CredentialSource::ManagedIdentity(ManagedIdentityCredential::from_env(
            "otel-ns.servicebus.windows.net",
            None,
        ))
    }

    #[test]
    fn test_connection_string_uses_sasl_plain() {
        let client_config = base_client_config(&config(), &connection_string(), "test");
        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("otel-ns.servicebus.windows.net:9093")
        );
        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client_config.get("sasl.username"), Some("$ConnectionString"));
        assert!(
            client_config
                .get("sasl.password")
                .is_some_and(|p| p.starts_with("Endpoint=sb://"))
        );
    }

    #[test]
    fn test_managed_identity_uses_oauthbearer() {
        let client_config = base_client_config(&config(), &managed_identity(), "test");
        assert_eq!(client_config.get("sasl.mechanism"), Some("OAUTHBEARER"));
        assert!(client_config.get("sasl.password").is_none());
    }

    #[test]
    fn test_plaintext_skips_sasl() {
        let local = EventHubConfig {
            security_protocol: "PLAINTEXT".to_string(),
            bootstrap_servers: Some("localhost:9092".to_string()),
            ..config()
        };
        let client_config = base_client_config(&local, &connection_string(), "test");
        assert_eq!(client_config.get("security.protocol"), Some("PLAINTEXT"));
        assert!(client_config.get("sasl.mechanism").is_none());
    }

    #[test]
    fn test_map_kafka_error() {
        let fatal = KafkaError::MessageConsumption(RDKafkaErrorCode::TopicAuthorizationFailed);
        assert!(matches!(
            map_kafka_error(&fatal),
            EventBusError::FatalTransport(_)
        ));

        let sasl = KafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed);
        assert!(map_kafka_error(&sasl).is_fatal());

        let librdkafka_fatal =
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(map_kafka_error(&librdkafka_fatal).is_fatal());

        let transient = KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure);
        let mapped = map_kafka_error(&transient);
        assert!(matches!(mapped, EventBusError::Receive(_)));
        assert!(mapped.is_retryable());
    }

    #[test]
    fn test_start_position_to_offset() {
        assert_eq!(to_kafka_offset(StartPosition::Earliest), Offset::Beginning);
        assert_eq!(to_kafka_offset(StartPosition::Latest), Offset::End);
        assert_eq!(to_kafka_offset(StartPosition::Committed), Offset::Stored);
        assert_eq!(to_kafka_offset(StartPosition::Offset(9)), Offset::Offset(9));
    }

    #[test]
    fn test_consumer_stores_offsets_only_on_ack() {
        let client_config = consumer_client_config(&config(), &managed_identity());
        assert_eq!(client_config.get("group.id"), Some("$Default"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("true"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client_config.get("sasl.mechanism"), Some("OAUTHBEARER"));
    }

    #[tokio::test]
    async fn test_main_queue_driver_runs_during_probe() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let driver = MainQueueDriver::spawn(|mut stop| async move {
            let _ = started_tx.send(());
            let _ = stop.changed().await;
        });

        // 探测只有在驱动任务已被调度时才能完成
        let (driver, partitions) = driver
            .probe(async {
                tokio::time::timeout(Duration::from_secs(2), started_rx)
                    .await
                    .map_err(|_| EventBusError::Connection("驱动任务未运行".to_string()))?
                    .map_err(|e| EventBusError::Internal(e.to_string()))?;
                Ok::<_, EventBusError>(vec![0, 1])
            })
            .await
            .unwrap();

        assert_eq!(partitions, vec![0, 1]);
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_probe_stops_driver() {
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let driver = MainQueueDriver::spawn(|mut stop| async move {
            let _ = stop.changed().await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        let result = driver
            .probe(async { Err::<Vec<i32>, _>(EventBusError::Connection("超时".to_string())) })
            .await;

        assert!(matches!(result, Err(EventBusError::Connection(_))));
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_context_identity_only_for_managed_identity() {
        assert!(
            EventHubContext::new("consumer", &connection_string())
                .identity
                .is_none()
        );
        assert!(
            EventHubContext::new("consumer", &managed_identity())
                .identity
                .is_some()
        );
    }
}
