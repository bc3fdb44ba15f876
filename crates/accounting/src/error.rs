//! 记账服务错误类型

use orderbus_shared::error::EventBusError;

#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    /// 事件负载不是有效的 OrderResult
    #[error("订单解码失败: {0}")]
    Decode(String),

    /// 订单写入数据库失败，整笔事务已回滚
    #[error("订单持久化失败: order_id={order_id}, {message}")]
    Persist { order_id: String, message: String },

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl AccountingError {
    /// 指标中使用的处理结果标签
    pub fn status(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_failed",
            Self::Persist { .. } => "persist_failed",
            Self::Migration(_) | Self::EventBus(_) => "error",
        }
    }
}
