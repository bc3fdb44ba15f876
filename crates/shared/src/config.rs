//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 除 `ORDERBUS_` 前缀变量外，还兼容部署脚本沿用的 `EVENTHUB_*` 等变量名。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::EventBusError;
use crate::eventhub::StartPosition;
use crate::observability::ObservabilityConfig;

/// 默认 channel 名称
pub const DEFAULT_CHANNEL_NAME: &str = "orders";

/// EventHub 连接配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventHubConfig {
    /// 命名空间（不含 `.servicebus.windows.net` 后缀时自动补全），必填
    pub namespace: String,
    /// channel（EventHub 实体 / topic）名称
    pub name: String,
    pub consumer_group: String,
    /// 配置后使用连接串认证，否则使用托管身份
    pub connection_string: Option<String>,
    /// 用户分配托管身份的 client id
    pub managed_identity_client_id: Option<String>,
    /// 覆盖 broker 地址（本地 Kafka / 模拟器）
    pub bootstrap_servers: Option<String>,
    pub security_protocol: String,
    pub start_position: StartPosition,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// 单个批次的字节上限
    pub max_batch_bytes: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: DEFAULT_CHANNEL_NAME.to_string(),
            consumer_group: "$Default".to_string(),
            connection_string: None,
            managed_identity_client_id: None,
            bootstrap_servers: None,
            security_protocol: "SASL_SSL".to_string(),
            start_position: StartPosition::Earliest,
            publish_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            shutdown_timeout_ms: 10_000,
            max_batch_bytes: 1_048_576,
        }
    }
}

impl EventHubConfig {
    /// 校验必需配置，必须在任何网络调用之前执行
    pub fn validate(&self) -> Result<(), EventBusError> {
        if self.namespace.trim().is_empty() {
            return Err(EventBusError::Configuration(
                "EventHub 命名空间未配置 (EVENTHUB_NAMESPACE)".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(EventBusError::Configuration(
                "EventHub 名称不能为空".to_string(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(EventBusError::Configuration(
                "消费组名称不能为空".to_string(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(EventBusError::Configuration(
                "max_batch_bytes 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 命名空间的完整主机名
    pub fn fully_qualified_namespace(&self) -> String {
        let namespace = self.namespace.trim();
        if namespace.contains('.') {
            namespace.to_string()
        } else {
            format!("{namespace}.servicebus.windows.net")
        }
    }

    /// Kafka 协议端点地址
    pub fn bootstrap_servers(&self) -> String {
        match &self.bootstrap_servers {
            Some(servers) if !servers.trim().is_empty() => servers.clone(),
            _ => format!("{}:9093", self.fully_qualified_namespace()),
        }
    }
}

/// 数据库配置
///
/// `url` 为空时视为未配置数据库，accounting 只记录日志不落库。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Feature flag 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureFlagConfig {
    /// OFREP 服务地址，例如 `http://flagd:8016`
    pub ofrep_endpoint: Option<String>,
    pub timeout_ms: u64,
    /// 未配置 OFREP 服务时 `kafkaQueueProblems` 的取值，0 表示关闭
    pub queue_problems: i64,
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            ofrep_endpoint: None,
            timeout_ms: 500,
            queue_problems: 0,
        }
    }
}

/// checkout 发布配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PublishConfig {
    /// 可重试错误的最大重试次数，0 表示只尝试一次
    pub publish_retries: u32,
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub eventhub: EventHubConfig,
    pub database: DatabaseConfig,
    pub feature_flags: FeatureFlagConfig,
    pub publish: PublishConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. 结构体默认值（消费组默认为 `default_consumer_group`）
    /// 2. config/default.toml、config/{environment}.toml、config/{service_name}.toml
    /// 3. 环境变量（ORDERBUS_ 前缀，`__` 分隔层级，如 ORDERBUS_EVENTHUB__NAMESPACE）
    /// 4. 部署变量（EVENTHUB_NAMESPACE、DB_CONNECTION_STRING 等）
    pub fn load(service_name: &str, default_consumer_group: &str) -> Result<Self, EventBusError> {
        // .env 仅用于本地开发，不存在时忽略
        let _ = dotenvy::dotenv();

        let env = std::env::var("ORDERBUS_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .set_default("eventhub.consumer_group", default_consumer_group)?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("ORDERBUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 应用部署脚本使用的环境变量
    ///
    /// 通过 `lookup` 注入变量来源，便于测试时不修改进程环境。空字符串视为未设置。
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(namespace) = get("EVENTHUB_NAMESPACE") {
            self.eventhub.namespace = namespace;
        }
        if let Some(name) = get("EVENTHUB_NAME") {
            self.eventhub.name = name;
        }
        if let Some(group) = get("EVENTHUB_CONSUMER_GROUP") {
            self.eventhub.consumer_group = group;
        }
        if let Some(conn) = get("EVENTHUB_CONNECTION_STRING") {
            self.eventhub.connection_string = Some(conn);
        }
        if let Some(client_id) = get("AZURE_CLIENT_ID") {
            self.eventhub.managed_identity_client_id = Some(client_id);
        }
        if let Some(url) = get("DB_CONNECTION_STRING") {
            self.database.url = Some(url);
        }
        if let Some(host) = get("FLAGD_HOST") {
            let port = get("FLAGD_OFREP_PORT").unwrap_or_else(|| "8016".to_string());
            self.feature_flags.ofrep_endpoint = Some(format!("http://{host}:{port}"));
        }
    }
}
