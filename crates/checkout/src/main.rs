//! checkout 订单发布工具
//!
//! 向 EventHub 发布随机订单，或发送一条 JSON 连通性测试消息。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use orderbus_shared::{config::AppConfig, eventhub::EventProducer, feature_flags, observability};
use tracing::{error, info};

use checkout::publisher::OrderPublisher;
use checkout::sample;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PayloadFormat {
    /// protobuf 编码的 OrderResult
    Proto,
    /// JSON 测试消息
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "checkout-publisher", about = "向 EventHub 发布订单事件")]
struct Args {
    /// 发布的订单数量
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// 两次发布之间的间隔（毫秒）
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    #[arg(long, value_enum, default_value_t = PayloadFormat::Proto)]
    format: PayloadFormat,

    /// 覆盖配置中的 EventHub 名称
    #[arg(long)]
    eventhub: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load("checkout", "checkout")?;
    if let Some(name) = args.eventhub {
        config.eventhub.name = name;
    }

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        eventhub = %config.eventhub.name,
        count = args.count,
        "checkout-publisher 启动"
    );

    let producer = Arc::new(EventProducer::connect(&config.eventhub).await?);
    let flags = feature_flags::from_config(&config.feature_flags);
    let publisher = OrderPublisher::from_config(producer, flags, &config.publish);

    let mut failed = 0u32;
    for i in 0..args.count {
        let result = match args.format {
            PayloadFormat::Proto => publisher.publish_order(&sample::random_order()).await,
            PayloadFormat::Json => {
                let order_id = format!("test-order-{}", uuid::Uuid::new_v4());
                match sample::json_test_payload(&order_id) {
                    Ok(payload) => publisher.publish_payload(&payload).await,
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            error!(index = i, error = %e, "订单发布失败");
            failed += 1;
        }

        if args.interval_ms > 0 && i + 1 < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    publisher.shutdown().await;

    info!(sent = args.count - failed, failed, "checkout-publisher 完成");
    if failed > 0 {
        anyhow::bail!("{failed} 个订单发布失败");
    }
    Ok(())
}
