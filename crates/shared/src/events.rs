//! 事件模型
//!
//! 定义发送端的 `EventData` / `EventDataBatch` 与接收端的 `ReceivedEvent`。
//! 事件体是不透明的二进制负载，订单事件使用 `order_proto::OrderResult` 的 protobuf 编码。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use order_proto::OrderResult;

use crate::error::EventBusError;

// ---------------------------------------------------------------------------
// EventData — 待发送事件
// ---------------------------------------------------------------------------

/// 待发送的事件
///
/// 发布后不可变：发送端按值移交给批次，之后不再暴露可变引用。
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub body: Vec<u8>,
    /// 分区路由键，同一键的事件落在同一分区
    pub partition_key: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// 用户自定义属性（也用于传播 trace context）
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            partition_key: None,
            created_at: Some(Utc::now()),
            properties: HashMap::new(),
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 估算的线上大小：事件体 + 路由键 + 属性
    pub fn encoded_size(&self) -> usize {
        let key_len = self.partition_key.as_ref().map_or(0, String::len);
        let props_len: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.body.len() + key_len + props_len
    }
}

// ---------------------------------------------------------------------------
// EventDataBatch — 有容量上限的发送批次
// ---------------------------------------------------------------------------

/// 发送批次，总大小不超过 `max_bytes`
#[derive(Debug)]
pub struct EventDataBatch {
    events: Vec<EventData>,
    size_bytes: usize,
    max_bytes: usize,
}

impl EventDataBatch {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            events: Vec::new(),
            size_bytes: 0,
            max_bytes,
        }
    }

    /// 追加事件；放不下时返回 `EventTooLarge`，批次保持不变
    pub fn try_add(&mut self, event: EventData) -> Result<(), EventBusError> {
        let size = event.encoded_size();
        if self.size_bytes + size > self.max_bytes {
            return Err(EventBusError::EventTooLarge {
                size: self.size_bytes + size,
                max: self.max_bytes,
            });
        }
        self.size_bytes += size;
        self.events.push(event);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn events(&self) -> &[EventData] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventData> {
        self.events
    }
}

// ---------------------------------------------------------------------------
// ReceivedEvent — 消费到的事件
// ---------------------------------------------------------------------------

/// 从某个分区读到的事件，拥有全部字段，可安全跨 await 点传递
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub channel: String,
    pub partition: i32,
    pub offset: i64,
    pub partition_key: Option<String>,
    pub body: Vec<u8>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub properties: HashMap<String, String>,
}

impl ReceivedEvent {
    /// 将负载视为 UTF-8 字符串返回
    pub fn body_str(&self) -> Result<&str, EventBusError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| EventBusError::Deserialization(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将负载解码为订单记录
    pub fn decode_order(&self) -> Result<OrderResult, EventBusError> {
        OrderResult::from_bytes(&self.body).map_err(|e| {
            EventBusError::Deserialization(format!(
                "订单解码失败 (partition={}, offset={}): {e}",
                self.partition, self.offset
            ))
        })
    }
}
