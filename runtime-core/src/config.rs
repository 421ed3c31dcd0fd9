//! Runtime configuration, delivered base64-encoded in the
//! `ENCORE_RUNTIME_CONFIG` environment variable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the environment variable carrying the encoded config.
pub const RUNTIME_CONFIG_ENV: &str = "ENCORE_RUNTIME_CONFIG";
/// Companion variable carrying app secrets.
pub const APP_SECRETS_ENV: &str = "ENCORE_APP_SECRETS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The full runtime configuration for one service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runtime {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_slug: String,
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub env_id: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default)]
    pub env_type: String,
    #[serde(default)]
    pub env_cloud: String,
    #[serde(default)]
    pub deploy_id: String,
    #[serde(default)]
    pub deploy_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub app_commit: String,
    /// Trace ingest endpoint; tracing is disabled when absent.
    #[serde(default)]
    pub trace_endpoint: Option<String>,
    #[serde(default)]
    pub auth_keys: Vec<AuthKeyConfig>,
    #[serde(default)]
    pub cors: Option<CorsConfig>,
    #[serde(default)]
    pub sql_servers: Vec<SqlServerConfig>,
    #[serde(default)]
    pub sql_databases: Vec<SqlDatabaseConfig>,
    #[serde(default)]
    pub pubsub_providers: Vec<PubsubProviderConfig>,
    #[serde(default)]
    pub pubsub_topics: HashMap<String, PubsubTopicConfig>,
    #[serde(default)]
    pub redis_servers: Vec<RedisServerConfig>,
    #[serde(default)]
    pub redis_databases: Vec<RedisDatabaseConfig>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    /// Nanoseconds; zero means the default.
    #[serde(default)]
    pub shutdown_timeout: i64,
}

impl Runtime {
    /// Decodes the value of [`RUNTIME_CONFIG_ENV`]: base64 (standard or
    /// URL-safe raw alphabet) wrapping JSON.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
        use base64::Engine;

        let bytes = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE_NO_PAD.decode(raw))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let raw =
            std::env::var(RUNTIME_CONFIG_ENV).map_err(|_| ConfigError::Missing(RUNTIME_CONFIG_ENV))?;
        Self::parse(&raw)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        if self.shutdown_timeout > 0 {
            Duration::from_nanos(self.shutdown_timeout as u64)
        } else {
            Duration::from_secs(5)
        }
    }

    pub fn tracing_enabled(&self) -> bool {
        self.trace_endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKeyConfig {
    pub kid: u32,
    /// Base64-encoded key material.
    pub data: String,
}

impl AuthKeyConfig {
    pub fn decode(&self) -> Result<crate::platform::AuthKey, base64::DecodeError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Ok(crate::platform::AuthKey {
            kid: self.kid,
            data: STANDARD.decode(&self.data)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub disable_credentials: bool,
    #[serde(default)]
    pub allow_origins_with_credentials: Vec<String>,
    #[serde(default)]
    pub allow_origins_without_credentials: Option<Vec<String>>,
    #[serde(default)]
    pub raw_allowed_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlServerConfig {
    pub host: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlDatabaseConfig {
    /// Name the application refers to the database by.
    pub name: String,
    pub server_id: usize,
    pub database_name: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub min_connections: u32,
    #[serde(default)]
    pub max_connections: u32,
}

/// Exactly one provider block is set per entry; `matches` on the provider
/// implementations dispatches on which.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubsubProviderConfig {
    #[serde(default)]
    pub memory: Option<MemoryProviderConfig>,
    #[serde(default)]
    pub push: Option<PushProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryProviderConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushProviderConfig {
    /// Service account the provider signs push JWTs as.
    #[serde(default)]
    pub service_account_email: String,
    #[serde(default)]
    pub jwt_audience: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubsubTopicConfig {
    pub provider_id: usize,
    /// The topic's name at the provider.
    pub provider_name: String,
    #[serde(default)]
    pub ordering_attr: Option<String>,
    #[serde(default)]
    pub subscriptions: HashMap<String, PubsubSubscriptionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubsubSubscriptionConfig {
    /// Globally unique id, used to route push deliveries.
    pub id: String,
    /// The subscription's name at the provider.
    pub provider_name: String,
    #[serde(default)]
    pub push_only: bool,
    /// Nanoseconds; zero means the default.
    #[serde(default)]
    pub ack_deadline: i64,
    /// Nanoseconds; zero means the default.
    #[serde(default)]
    pub message_retention: i64,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Nanoseconds.
    #[serde(default)]
    pub min_backoff: i64,
    /// Nanoseconds.
    #[serde(default)]
    pub max_backoff: i64,
    #[serde(default)]
    pub max_retries: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisServerConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub enable_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisDatabaseConfig {
    /// Name the application refers to the cluster by.
    pub name: String,
    pub server_id: usize,
    #[serde(default)]
    pub database: i64,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub max_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "app_id": "app-123",
            "app_slug": "blog",
            "env_id": "env-1",
            "env_name": "prod",
            "env_type": "production",
            "env_cloud": "gcp",
            "deploy_id": "deploy-9",
            "trace_endpoint": "https://trace.example.com/trace",
            "auth_keys": [{"kid": 42, "data": STANDARD.encode(b"secret")}],
            "shutdown_timeout": 2_000_000_000i64,
            "pubsub_providers": [{"memory": {}}],
            "pubsub_topics": {
                "emails": {
                    "provider_id": 0,
                    "provider_name": "emails-prod",
                    "subscriptions": {
                        "send": {"id": "sub-1", "provider_name": "send-prod"}
                    }
                }
            }
        })
    }

    #[test]
    fn parses_standard_base64() {
        let raw = STANDARD.encode(sample_json().to_string());
        let cfg = Runtime::parse(&raw).unwrap();
        assert_eq!(cfg.app_id, "app-123");
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(2));
        assert!(cfg.tracing_enabled());
        assert_eq!(cfg.auth_keys[0].decode().unwrap().data, b"secret");
        let topic = &cfg.pubsub_topics["emails"];
        assert_eq!(topic.provider_name, "emails-prod");
        assert_eq!(topic.subscriptions["send"].id, "sub-1");
    }

    #[test]
    fn parses_url_safe_base64() {
        let raw = URL_SAFE_NO_PAD.encode(sample_json().to_string());
        let cfg = Runtime::parse(&raw).unwrap();
        assert_eq!(cfg.env_cloud, "gcp");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Runtime::parse("!!!not-base64!!!").is_err());
        let not_json = STANDARD.encode("not json");
        assert!(Runtime::parse(&not_json).is_err());
    }

    #[test]
    fn defaults_apply() {
        let raw = STANDARD.encode("{}");
        let cfg = Runtime::parse(&raw).unwrap();
        assert!(!cfg.tracing_enabled());
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(5));
        assert!(cfg.pubsub_topics.is_empty());
    }
}
