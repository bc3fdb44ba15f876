//! checkout 订单发布
//!
//! 下单完成后把 `OrderResult` 编码为 protobuf 并发布到 EventHub，
//! 由 fraud-detection 与 accounting 各自的消费组独立消费。

pub mod error;
pub mod publisher;
pub mod sample;
