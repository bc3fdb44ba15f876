//! 共享库
//!
//! 包含 checkout、fraud-detection、accounting 共用的配置、错误处理、
//! EventHub 生产者与消费者、feature flag、数据库连接和可观测性等基础设施代码。

pub mod config;
pub mod database;
pub mod error;
pub mod eventhub;
pub mod events;
pub mod feature_flags;
pub mod observability;
pub mod retry;
pub mod signal;
pub mod test_utils;
