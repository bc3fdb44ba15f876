//! 欺诈检测服务
//!
//! 以 `fraud-detection` 消费组读取订单事件，解码后累加订单计数。
//! 解码失败的事件记录后跳过，不影响后续读取。

pub mod error;
pub mod handler;
