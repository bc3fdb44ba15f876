//! 欺诈检测服务
//!
//! 以 fraud-detection 消费组读取订单事件直到收到关闭信号。

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::Result;
use orderbus_shared::{
    config::AppConfig,
    eventhub::EventConsumer,
    feature_flags::{self, FlagDelay},
    observability,
    signal::shutdown_signal,
};
use tracing::info;

use fraud_detection::handler::{FraudDetectionHandler, SERVICE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME, SERVICE_NAME)?;

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        eventhub = %config.eventhub.name,
        consumer_group = %config.eventhub.consumer_group,
        "fraud-detection 启动"
    );

    let consumer = EventConsumer::connect(&config.eventhub).await?;

    let flags = feature_flags::from_config(&config.feature_flags);
    let counter = Arc::new(AtomicU64::new(0));
    let handler = Arc::new(FraudDetectionHandler::new(
        counter.clone(),
        Arc::new(FlagDelay::queue_problems(flags)),
    ));

    consumer.run_until(handler.clone(), shutdown_signal()).await?;

    info!(processed = handler.processed(), "fraud-detection 已停止");
    Ok(())
}
