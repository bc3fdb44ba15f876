//! 记账服务
//!
//! 以 accounting 消费组读取订单事件直到收到关闭信号。
//! 只有配置了数据库连接串时才建立连接池并落库。

use std::sync::Arc;

use anyhow::Result;
use orderbus_shared::{
    config::AppConfig,
    database::Database,
    eventhub::EventConsumer,
    feature_flags::{self, FlagDelay},
    observability,
    signal::shutdown_signal,
};
use tracing::info;

use accounting::handler::{AccountingHandler, SERVICE_NAME};
use accounting::store::{OrderStore, PgOrderStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME, SERVICE_NAME)?;

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        eventhub = %config.eventhub.name,
        consumer_group = %config.eventhub.consumer_group,
        "accounting 启动"
    );

    // 先校验 EventHub 配置，避免在缺少命名空间时仍去连接数据库
    config.eventhub.validate()?;

    let database = if config.database.is_configured() {
        let db = Database::connect(&config.database).await?;
        db.health_check().await?;
        Some(db)
    } else {
        info!("未配置数据库，订单只记录日志");
        None
    };

    let store: Option<Arc<dyn OrderStore>> = match &database {
        Some(db) => {
            let store = PgOrderStore::new(db.pool().clone());
            if config.database.run_migrations {
                store.migrate().await?;
            }
            Some(Arc::new(store))
        }
        None => None,
    };

    let consumer = EventConsumer::connect(&config.eventhub).await?;

    let flags = feature_flags::from_config(&config.feature_flags);
    let handler = Arc::new(AccountingHandler::new(
        store,
        Arc::new(FlagDelay::queue_problems(flags)),
    ));

    let result = consumer.run_until(handler.clone(), shutdown_signal()).await;

    if let Some(db) = database {
        db.close().await;
    }

    let stats = handler.stats();
    info!(
        received = stats.received(),
        persisted = stats.persisted(),
        failed = stats.failed(),
        "accounting 已停止"
    );
    result?;
    Ok(())
}
