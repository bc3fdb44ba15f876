//! 凭据来源
//!
//! 两种认证方式：
//! - 连接串：Kafka 端点上使用 SASL PLAIN，用户名固定为 `$ConnectionString`
//! - 托管身份（默认）：SASL OAUTHBEARER，令牌由运行环境的身份端点签发，进程内不保存密钥
//!
//! 令牌刷新的调度由 Kafka 客户端负责，这里只负责按需获取一次令牌。

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EventHubConfig;
use crate::error::EventBusError;

/// 实例元数据服务的令牌端点
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CredentialSource
// ---------------------------------------------------------------------------

/// 进程认证方式
#[derive(Debug, Clone)]
pub enum CredentialSource {
    ConnectionString(ConnectionString),
    ManagedIdentity(ManagedIdentityCredential),
}

impl CredentialSource {
    /// 配置了连接串时使用连接串，否则使用托管身份
    pub fn from_config(config: &EventHubConfig) -> Result<Self, EventBusError> {
        match config
            .connection_string
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            Some(raw) => {
                let conn = ConnectionString::parse(raw)?;
                if let Some(entity) = conn.entity_path.as_deref()
                    && entity != config.name
                {
                    warn!(
                        entity_path = entity,
                        eventhub = %config.name,
                        "连接串中的 EntityPath 与配置的 EventHub 名称不一致"
                    );
                }
                info!("使用 EventHub 连接串认证");
                Ok(Self::ConnectionString(conn))
            }
            None => {
                info!(
                    client_id = ?config.managed_identity_client_id,
                    "使用托管身份认证"
                );
                Ok(Self::ManagedIdentity(ManagedIdentityCredential::from_env(
                    &config.fully_qualified_namespace(),
                    config.managed_identity_client_id.clone(),
                )))
            }
        }
    }

    /// 对应的 SASL 机制
    pub fn sasl_mechanism(&self) -> &'static str {
        match self {
            Self::ConnectionString(_) => "PLAIN",
            Self::ManagedIdentity(_) => "OAUTHBEARER",
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionString
// ---------------------------------------------------------------------------

/// 解析后的共享访问连接串
#[derive(Clone)]
pub struct ConnectionString {
    raw: String,
    pub endpoint: String,
    pub shared_access_key_name: Option<String>,
    pub entity_path: Option<String>,
}

impl std::fmt::Debug for ConnectionString {
    // 连接串包含密钥，调试输出时隐藏
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

impl ConnectionString {
    /// 解析 `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...;EntityPath=...`
    pub fn parse(raw: &str) -> Result<Self, EventBusError> {
        let raw = raw.trim();
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in raw.split(';').filter(|p| !p.trim().is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                return Err(EventBusError::Configuration(format!(
                    "连接串片段缺少 '=': {}",
                    name_only(part)
                )));
            };
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(value.trim().to_string()),
                "entitypath" => entity_path = Some(value.trim().to_string()),
                other => debug!(field = other, "忽略未知的连接串字段"),
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| EventBusError::Configuration("连接串缺少 Endpoint".to_string()))?;

        if key_name.is_some() != key.is_some() {
            return Err(EventBusError::Configuration(
                "连接串中 SharedAccessKeyName 与 SharedAccessKey 必须同时出现".to_string(),
            ));
        }

        Ok(Self {
            raw: raw.to_string(),
            endpoint,
            shared_access_key_name: key_name,
            entity_path,
        })
    }

    /// 作为 SASL PLAIN 密码使用的原始连接串
    pub fn as_sasl_password(&self) -> &str {
        &self.raw
    }

    /// Endpoint 中的主机名
    pub fn host(&self) -> &str {
        let without_scheme = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        without_scheme.trim_end_matches('/')
    }
}

/// 错误信息中只保留字段名，避免把密钥写进日志
fn name_only(part: &str) -> &str {
    part.split_once('=').map_or("<无名字段>", |(name, _)| name)
}

// ---------------------------------------------------------------------------
// ManagedIdentityCredential
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenEndpoint {
    /// 虚拟机 / AKS 上的实例元数据服务
    Imds,
    /// App Service / Container Apps 注入的身份端点
    AppService { endpoint: String, header: String },
}

/// 托管身份凭据
#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    resource: String,
    client_id: Option<String>,
    endpoint: TokenEndpoint,
}

/// 访问令牌
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// 过期时间（Unix 毫秒）
    pub expires_on_ms: i64,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on_ms", &self.expires_on_ms)
            .finish()
    }
}

impl ManagedIdentityCredential {
    /// 根据运行环境选择令牌端点
    pub fn from_env(namespace_host: &str, client_id: Option<String>) -> Self {
        Self::from_lookup(namespace_host, client_id, |k| std::env::var(k).ok())
    }

    fn from_lookup(
        namespace_host: &str,
        client_id: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let endpoint = match (lookup("IDENTITY_ENDPOINT"), lookup("IDENTITY_HEADER")) {
            (Some(endpoint), Some(header)) if !endpoint.is_empty() && !header.is_empty() => {
                TokenEndpoint::AppService { endpoint, header }
            }
            _ => TokenEndpoint::Imds,
        };

        Self {
            resource: format!("https://{namespace_host}"),
            client_id,
            endpoint,
        }
    }

    /// 令牌主体名，用于 OAUTHBEARER 令牌的 principal
    pub fn principal_name(&self) -> &str {
        self.client_id.as_deref().unwrap_or("managed-identity")
    }

    /// 同步获取令牌
    ///
    /// 由 Kafka 客户端的后台线程调用。请求在独立线程上执行，
    /// 保证调用方即使处于异步运行时内也不会阻塞其工作线程上的 reactor。
    pub fn fetch_token(&self) -> Result<AccessToken, EventBusError> {
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.fetch_token_blocking())
                .join()
                .map_err(|_| EventBusError::Credential("令牌请求线程异常退出".to_string()))?
        })
    }

    fn fetch_token_blocking(&self) -> Result<AccessToken, EventBusError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EventBusError::Credential(format!("创建 HTTP 客户端失败: {e}")))?;

        let mut query = vec![("resource", self.resource.as_str())];
        if let Some(client_id) = self.client_id.as_deref() {
            query.push(("client_id", client_id));
        }

        let request = match &self.endpoint {
            TokenEndpoint::Imds => client
                .get(IMDS_TOKEN_ENDPOINT)
                .query(&[("api-version", IMDS_API_VERSION)])
                .query(&query)
                .header("Metadata", "true"),
            TokenEndpoint::AppService { endpoint, header } => client
                .get(endpoint)
                .query(&[("api-version", APP_SERVICE_API_VERSION)])
                .query(&query)
                .header("X-IDENTITY-HEADER", header),
        };

        let response = request
            .send()
            .map_err(|e| EventBusError::Credential(format!("请求身份端点失败: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| EventBusError::Credential(format!("读取令牌响应失败: {e}")))?;

        if !status.is_success() {
            return Err(EventBusError::Credential(format!(
                "身份端点返回 {status}: {body}"
            )));
        }

        let token = parse_token_response(&body, Utc::now().timestamp_millis())?;
        debug!(expires_on_ms = token.expires_on_ms, "已获取托管身份令牌");
        Ok(token)
    }
}

/// 解析身份端点响应
///
/// `expires_on` 为 Unix 秒，不同端点返回字符串或数字；缺失时退回 `expires_in`（相对秒数）。
pub(crate) fn parse_token_response(body: &str, now_ms: i64) -> Result<AccessToken, EventBusError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| EventBusError::Credential(format!("令牌响应不是合法 JSON: {e}")))?;

    let token = value["access_token"]
        .as_str()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EventBusError::Credential("令牌响应缺少 access_token".to_string()))?
        .to_string();

    let as_i64 = |v: &Value| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()));

    let expires_on_ms = match (as_i64(&value["expires_on"]), as_i64(&value["expires_in"])) {
        (Some(on), _) => on * 1000,
        (None, Some(secs)) => now_ms + secs * 1000,
        (None, None) => {
            return Err(EventBusError::Credential(
                "令牌响应缺少过期时间".to_string(),
            ));
        }
    };

    Ok(AccessToken {
        token,
        expires_on_ms,
    })
}
