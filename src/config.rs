//! Configuration — TOML file defaults + environment variable overrides.
//!
//! Tunables live in `config/default.toml`. Secrets (database URL, aggregator
//! API key, bot token) come from environment variables and are never written
//! back out: fields holding them carry a redacting Debug.

use serde::Deserialize;
use std::env;
use std::fmt;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub aggregator: AggregatorConfig,
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub dca: DcaConfig,
    pub limit: LimitConfig,
    pub prices: PricesConfig,
    pub auth: AuthConfig,
    pub telegram: TelegramConfig,
    pub web: WebConfig,
    pub logging: LoggingConfig,
}

/// A secret string that never appears in Debug output or logs.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_empty() { "<unset>" } else { "<redacted>" })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Secret,
    #[serde(default)]
    pub affiliate_id: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_aggregator_url() -> String {
    "https://sideshift.ai/api/v2".into()
}
fn default_http_timeout() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Secret,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_tick")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

fn default_monitor_tick() -> u64 {
    10
}
fn default_max_concurrent() -> usize {
    5
}
fn default_reconcile_interval() -> u64 {
    3600
}

impl MonitorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcaConfig {
    #[serde(default = "default_dca_tick")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_dca_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_dca_max_processing")]
    pub max_processing_time_secs: u64,
}

fn default_dca_tick() -> u64 {
    60
}
fn default_dca_retry_delay() -> u64 {
    300
}
fn default_dca_max_processing() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_limit_tick")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_staleness")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_limit_tick() -> u64 {
    30
}
fn default_max_staleness() -> u64 {
    600
}
fn default_max_retries() -> i32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricesConfig {
    #[serde(default = "default_prices_tick")]
    pub tick_interval_secs: u64,
}

fn default_prices_tick() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Identity provider base URL; bearer tokens are verified against its
    /// userinfo endpoint. Empty disables user auth (local development only).
    #[serde(default)]
    pub token_issuer: String,
    /// Static operations token accepted for admin routes when set.
    #[serde(default)]
    pub ops_token: Secret,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<Secret>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_output: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from `config/default.toml` merged with env vars.
    /// Secrets come from env vars, not from TOML.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("SWAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        // Override secrets from env (these should never be in TOML)
        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database.url = v.into();
        }
        if let Ok(v) = env::var("AGGREGATOR_API_KEY") {
            cfg.aggregator.api_key = v.into();
        }
        if let Ok(v) = env::var("AGGREGATOR_AFFILIATE_ID") {
            cfg.aggregator.affiliate_id = v;
        }
        if let Ok(v) = env::var("OPS_TOKEN") {
            cfg.auth.ops_token = v.into();
        }
        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN") {
            cfg.telegram.bot_token = Some(v.into());
        }
        if let Ok(v) = env::var("TELEGRAM_CHAT_ID") {
            cfg.telegram.chat_id = Some(v);
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        let json = serde_json::json!({
            "aggregator": {},
            "database": {},
            "monitor": {},
            "dca": {},
            "limit": {},
            "prices": {},
            "auth": {},
            "telegram": { "bot_token": null, "chat_id": null },
            "web": {},
            "logging": {},
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn defaults_match_deployment() {
        let cfg = minimal();
        assert_eq!(cfg.monitor.tick_interval_secs, 10);
        assert_eq!(cfg.monitor.max_concurrent, 5);
        assert_eq!(cfg.dca.tick_interval_secs, 60);
        assert_eq!(cfg.dca.retry_delay_secs, 300);
        assert_eq!(cfg.dca.max_processing_time_secs, 600);
        assert_eq!(cfg.limit.tick_interval_secs, 30);
        assert_eq!(cfg.limit.max_staleness_secs, 600);
        assert_eq!(cfg.limit.max_retries, 5);
        assert_eq!(cfg.database.max_connections, 10);
        assert_eq!(cfg.aggregator.http_timeout_secs, 20);
    }

    #[test]
    fn secrets_never_debug_print() {
        let mut cfg = minimal();
        cfg.database.url = "postgres://user:hunter2@db/swap".to_string().into();
        cfg.aggregator.api_key = "sk-live-abcdef".to_string().into();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sk-live-abcdef"));
        assert!(rendered.contains("<redacted>"));
    }
}
