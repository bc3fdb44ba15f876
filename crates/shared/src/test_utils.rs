//! 测试工具模块
//!
//! 提供集成测试所需的内存事件通道、记录型 handler 和测试数据生成器，
//! 使生产者与消费者的行为可以在不连接 EventHub 的情况下验证。

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use order_proto::{Address, CartItem, Money, OrderItem, OrderResult};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::eventhub::{EventHandler, EventSender, EventSource, PartitionReceiver, StartPosition};
use crate::events::{EventData, EventDataBatch, ReceivedEvent};

// ==================== 测试数据 ====================

/// 生成唯一的测试订单 ID
pub fn test_order_id() -> String {
    format!("test-order-{}", Uuid::new_v4())
}

/// 创建一个包含两件商品的测试订单
pub fn test_order(order_id: &str) -> OrderResult {
    OrderResult {
        order_id: order_id.to_string(),
        shipping_tracking_id: format!("track-{order_id}"),
        shipping_cost: Some(Money::new("USD", 8, 990_000_000)),
        shipping_address: Some(Address {
            street_address: "1600 Amphitheatre Parkway".to_string(),
            city: "Mountain View".to_string(),
            state: "CA".to_string(),
            country: "United States".to_string(),
            zip_code: "94043".to_string(),
        }),
        items: vec![
            OrderItem {
                item: Some(CartItem {
                    product_id: "OLJCESPC7Z".to_string(),
                    quantity: 2,
                }),
                cost: Some(Money::new("USD", 101, 960_000_000)),
            },
            OrderItem {
                item: Some(CartItem {
                    product_id: "66VCHSJNUP".to_string(),
                    quantity: 1,
                }),
                cost: Some(Money::new("USD", 349, 950_000_000)),
            },
        ],
    }
}

// ==================== 内存事件通道 ====================

struct ChannelInner {
    name: String,
    partitions: Vec<Mutex<Vec<ReceivedEvent>>>,
    /// (消费组, 分区) → 下一条待读取的偏移量
    committed: Mutex<HashMap<(String, i32), i64>>,
    fatal: Mutex<HashMap<i32, String>>,
    publish_failures: Mutex<VecDeque<EventBusError>>,
    closed_sources: Mutex<HashMap<String, bool>>,
    next_partition: AtomicUsize,
    notify: Notify,
}

/// 内存中的分区事件日志
///
/// 行为与托管服务一致：按路由键哈希或轮询选择分区，分区内有序；
/// 每个消费组独立维护读取位置。可注入发送失败和分区致命错误。
#[derive(Clone)]
pub struct InMemoryChannel {
    inner: Arc<ChannelInner>,
}

impl InMemoryChannel {
    pub fn new(name: &str, partition_count: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                partitions: (0..partition_count).map(|_| Mutex::new(Vec::new())).collect(),
                committed: Mutex::new(HashMap::new()),
                fatal: Mutex::new(HashMap::new()),
                publish_failures: Mutex::new(VecDeque::new()),
                closed_sources: Mutex::new(HashMap::new()),
                next_partition: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 发送端
    pub fn sender(&self) -> Arc<InMemorySender> {
        Arc::new(InMemorySender {
            channel: self.clone(),
        })
    }

    /// 以指定消费组身份读取的接收端
    pub fn source(&self, consumer_group: &str) -> Arc<InMemorySource> {
        self.inner
            .closed_sources
            .lock()
            .insert(consumer_group.to_string(), false);
        Arc::new(InMemorySource {
            channel: self.clone(),
            consumer_group: consumer_group.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// 下一次发送返回指定错误（可多次调用排队）
    pub fn fail_next_publish(&self, err: EventBusError) {
        self.inner.publish_failures.lock().push_back(err);
    }

    /// 让指定分区的接收器返回致命错误
    pub fn inject_fatal(&self, partition: i32, reason: &str) {
        self.inner.fatal.lock().insert(partition, reason.to_string());
        self.inner.notify.notify_waiters();
    }

    /// 绕过发送端直接写入原始负载
    pub fn publish_raw(&self, partition: Option<i32>, body: Vec<u8>) {
        self.append(EventData::new(body), partition);
    }

    /// 指定分区中的全部事件
    pub fn events(&self, partition: i32) -> Vec<ReceivedEvent> {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.inner.partitions.get(p))
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// 全部分区的事件总数
    pub fn len(&self) -> usize {
        self.inner.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 消费组在某分区已提交的位置
    pub fn committed(&self, consumer_group: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .lock()
            .get(&(consumer_group.to_string(), partition))
            .copied()
    }

    pub fn is_source_closed(&self, consumer_group: &str) -> bool {
        self.inner
            .closed_sources
            .lock()
            .get(consumer_group)
            .copied()
            .unwrap_or(false)
    }

    fn select_partition(&self, key: Option<&str>) -> usize {
        let count = self.inner.partitions.len().max(1);
        match key {
            Some(key) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => self.inner.next_partition.fetch_add(1, Ordering::Relaxed) % count,
        }
    }

    fn append(&self, event: EventData, partition: Option<i32>) {
        let index = partition
            .and_then(|p| usize::try_from(p).ok())
            .unwrap_or_else(|| self.select_partition(event.partition_key.as_deref()));
        let Some(log) = self.inner.partitions.get(index) else {
            return;
        };

        {
            let mut log = log.lock();
            let offset = log.len() as i64;
            log.push(ReceivedEvent {
                channel: self.inner.name.clone(),
                partition: index as i32,
                offset,
                partition_key: event.partition_key,
                body: event.body,
                enqueued_at: Some(Utc::now()),
                properties: event.properties,
            });
        }
        self.inner.notify.notify_waiters();
    }
}

/// 内存通道的发送端
pub struct InMemorySender {
    channel: InMemoryChannel,
}

#[async_trait]
impl EventSender for InMemorySender {
    async fn send_batch(&self, batch: EventDataBatch) -> Result<(), EventBusError> {
        if let Some(err) = self.channel.inner.publish_failures.lock().pop_front() {
            return Err(err);
        }
        for event in batch.into_events() {
            self.channel.append(event, None);
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// 内存通道的接收端
pub struct InMemorySource {
    channel: InMemoryChannel,
    consumer_group: String,
    closed: AtomicBool,
}

#[async_trait]
impl EventSource for InMemorySource {
    async fn partition_ids(&self) -> Result<Vec<i32>, EventBusError> {
        Ok((0..self.channel.inner.partitions.len() as i32).collect())
    }

    async fn open_partitions(
        &self,
        partitions: &[i32],
        position: StartPosition,
    ) -> Result<Vec<Box<dyn PartitionReceiver>>, EventBusError> {
        let mut receivers: Vec<Box<dyn PartitionReceiver>> = Vec::new();
        for &partition in partitions {
            let len = self.channel.events(partition).len() as i64;
            let cursor = match position {
                StartPosition::Earliest => 0,
                StartPosition::Latest => len,
                StartPosition::Committed => self
                    .channel
                    .committed(&self.consumer_group, partition)
                    .unwrap_or(0),
                StartPosition::Offset(n) => n,
            };
            receivers.push(Box::new(InMemoryReceiver {
                channel: self.channel.clone(),
                consumer_group: self.consumer_group.clone(),
                partition,
                cursor,
            }));
        }
        Ok(receivers)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.channel
                .inner
                .closed_sources
                .lock()
                .insert(self.consumer_group.clone(), true);
        }
    }
}

struct InMemoryReceiver {
    channel: InMemoryChannel,
    consumer_group: String,
    partition: i32,
    cursor: i64,
}

impl InMemoryReceiver {
    fn try_next(&mut self) -> Option<Result<ReceivedEvent, EventBusError>> {
        let inner = &self.channel.inner;
        if let Some(reason) = inner.fatal.lock().get(&self.partition) {
            return Some(Err(EventBusError::FatalTransport(reason.clone())));
        }

        let log = inner.partitions.get(self.partition as usize)?.lock();
        let event = log.get(self.cursor as usize)?.clone();
        drop(log);

        self.cursor += 1;
        Some(Ok(event))
    }
}

#[async_trait]
impl PartitionReceiver for InMemoryReceiver {
    fn partition_id(&self) -> i32 {
        self.partition
    }

    async fn recv(&mut self) -> Result<ReceivedEvent, EventBusError> {
        loop {
            let channel = self.channel.clone();
            let notified = channel.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记等待再检查，避免错过检查与等待之间的写入
            notified.as_mut().enable();

            if let Some(result) = self.try_next() {
                return result;
            }
            notified.await;
        }
    }

    fn ack(&mut self, offset: i64) -> Result<(), EventBusError> {
        self.channel
            .inner
            .committed
            .lock()
            .insert((self.consumer_group.clone(), self.partition), offset + 1);
        Ok(())
    }
}

// ==================== 记录型 handler ====================

/// 记录收到的每条事件，供断言使用
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ReceivedEvent>>,
    notify: Notify,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每条事件处理前先等待 `delay`，模拟慢 handler
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ReceivedEvent> {
        self.events.lock().clone()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.events.lock().iter().map(|e| e.body.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// 等待至少收到 `expected` 条事件，超时返回 false
    pub async fn wait_for_count(&self, expected: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: ReceivedEvent) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}
