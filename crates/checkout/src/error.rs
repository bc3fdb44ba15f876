//! checkout 专用错误类型

use orderbus_shared::error::EventBusError;
use orderbus_shared::retry::Retryable;

/// 订单发布错误
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// 测试负载序列化失败
    #[error("负载序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl Retryable for CheckoutError {
    /// 序列化失败重试也不会成功，只跟随事件总线错误的判定
    fn is_retryable(&self) -> bool {
        match self {
            Self::EventBus(e) => e.is_retryable(),
            _ => false,
        }
    }
}
