//! 欺诈检测服务错误类型

use orderbus_shared::error::EventBusError;

#[derive(Debug, thiserror::Error)]
pub enum FraudError {
    /// 事件负载不是有效的 OrderResult
    #[error("订单解码失败: {0}")]
    Decode(String),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl FraudError {
    /// 指标中使用的处理结果标签
    pub fn status(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_failed",
            Self::EventBus(_) => "error",
        }
    }
}
