//! 统一错误处理模块
//!
//! 定义事件总线（生产者、消费者、凭据、持久化）共享的错误类型，使用 thiserror 提供良好的错误信息。

use std::time::Duration;

use thiserror::Error;

/// 事件总线错误类型
#[derive(Debug, Error)]
pub enum EventBusError {
    // ==================== 启动期错误 ====================
    /// 必需配置缺失或非法，进程应在建立任何连接前退出
    #[error("配置错误: {0}")]
    Configuration(String),

    /// broker 不可达、凭据被拒绝或 channel 不存在
    #[error("连接失败: {0}")]
    Connection(String),

    #[error("凭据获取失败: {0}")]
    Credential(String),

    // ==================== 生产者错误 ====================
    #[error("事件发送失败: {0}")]
    Publish(String),

    #[error("事件过大: {size} 字节，批次上限 {max} 字节")]
    EventTooLarge { size: usize, max: usize },

    #[error("客户端已关闭")]
    Closed,

    // ==================== 单条事件错误 ====================
    #[error("事件反序列化失败: {0}")]
    Deserialization(String),

    #[error("持久化失败: {0}")]
    Persist(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    // ==================== 消费者错误 ====================
    /// 瞬时接收错误，读取循环记录后继续
    #[error("接收事件出错: {0}")]
    Receive(String),

    /// 读取循环无法继续，进程需由外部监管者重启
    #[error("传输层不可恢复错误: {0}")]
    FatalTransport(String),

    #[error("状态非法: {0}")]
    InvalidState(String),

    #[error("停止超时: 等待 {0:?} 后分区循环仍未退出")]
    ShutdownTimeout(Duration),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, EventBusError>;

impl EventBusError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Credential(_) => "CREDENTIAL_ERROR",
            Self::Publish(_) => "PUBLISH_ERROR",
            Self::EventTooLarge { .. } => "EVENT_TOO_LARGE",
            Self::Closed => "CLOSED",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::Persist(_) => "PERSIST_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Receive(_) => "RECEIVE_ERROR",
            Self::FatalTransport(_) => "FATAL_TRANSPORT_ERROR",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::ShutdownTimeout(_) => "SHUTDOWN_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误（由调用方决定是否真的重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Publish(_)
                | Self::Connection(_)
                | Self::Credential(_)
                | Self::Receive(_)
                | Self::Database(_)
        )
    }

    /// 是否需要终止当前消费者或进程
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalTransport(_) | Self::Configuration(_))
    }
}

impl From<config::ConfigError> for EventBusError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
