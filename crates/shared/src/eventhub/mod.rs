//! EventHub 事件通道
//!
//! 生产者把订单事件写入 channel，各消费组独立地从所有分区读取。
//! 分区、位点持久化和持久性由托管服务负责，这里只定义客户端侧的抽象：
//! - `EventSender` / `EventSource` / `PartitionReceiver`：传输层接缝，
//!   生产实现基于 EventHub 的 Kafka 协议端点（见 `kafka`），测试使用 `test_utils::InMemoryChannel`
//! - `EventProducer`：单次发送、无内部重试
//! - `EventConsumer`：每个分区一个读取任务，共享同一个关闭信号

pub mod consumer;
pub mod credential;
pub mod kafka;
pub mod producer;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EventBusError;
use crate::events::{EventDataBatch, ReceivedEvent};

pub use consumer::{ConsumerState, EventConsumer, EventHandler};
pub use credential::{ConnectionString, CredentialSource, ManagedIdentityCredential};
pub use producer::EventProducer;

// ---------------------------------------------------------------------------
// StartPosition — 读取起点
// ---------------------------------------------------------------------------

/// 消费者启动时每个分区的读取起点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum StartPosition {
    /// 最早的保留事件（每次重启都会重读全部历史）
    Earliest,
    /// 只读取启动之后写入的事件
    Latest,
    /// 从消费组已提交的位点继续，没有提交记录时退回 Earliest
    Committed,
    /// 指定偏移量
    Offset(i64),
}

impl FromStr for StartPosition {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            "committed" => Ok(Self::Committed),
            other => other
                .strip_prefix("offset:")
                .and_then(|n| n.trim().parse::<i64>().ok())
                .filter(|n| *n >= 0)
                .map(Self::Offset)
                .ok_or_else(|| {
                    EventBusError::Configuration(format!(
                        "无效的 start_position: {s}（可选 earliest / latest / committed / offset:<n>）"
                    ))
                }),
        }
    }
}

impl TryFrom<String> for StartPosition {
    type Error = EventBusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
            Self::Committed => write!(f, "committed"),
            Self::Offset(n) => write!(f, "offset:{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// 传输层接缝
// ---------------------------------------------------------------------------

/// 发送端传输
#[async_trait]
pub trait EventSender: Send + Sync {
    /// 发送整个批次，broker 确认持久接收后才返回成功
    async fn send_batch(&self, batch: EventDataBatch) -> Result<(), EventBusError>;

    /// 释放连接，可重复调用
    async fn close(&self);
}

/// 接收端传输，绑定一个 channel 和一个消费组
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 启动时发现的分区列表
    async fn partition_ids(&self) -> Result<Vec<i32>, EventBusError>;

    /// 为每个分区打开独立的接收器
    async fn open_partitions(
        &self,
        partitions: &[i32],
        position: StartPosition,
    ) -> Result<Vec<Box<dyn PartitionReceiver>>, EventBusError>;

    /// 释放连接，可重复调用
    async fn close(&self);
}

/// 单分区接收器，按分区内顺序返回事件
#[async_trait]
pub trait PartitionReceiver: Send {
    fn partition_id(&self) -> i32;

    /// 长轮询等待下一条事件；必须可被取消（drop future 不丢事件）
    async fn recv(&mut self) -> Result<ReceivedEvent, EventBusError>;

    /// handler 处理完 `offset` 处的事件后调用，消费组位置推进到它之后
    ///
    /// 未确认的事件在以 `committed` 位置重启时会再次投递。
    fn ack(&mut self, offset: i64) -> Result<(), EventBusError>;
}
