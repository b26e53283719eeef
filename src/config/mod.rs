//! Configuration management

use crate::infrastructure::protocols::sip::SipError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub agent: AgentConfig,
    pub keepalive: KeepaliveConfig,
}

/// Credentials and registrar location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    /// Realm used when hashing credentials. The target server expects this
    /// literal, not the realm it advertises in its challenge.
    pub realm: String,
    pub server_host: String,
    pub server_port: u16,
}

/// Local endpoint and transaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub user_agent: String,
    /// Registration expiry in seconds
    pub expires: u32,
    pub allow: Vec<String>,
    /// Maximum wait for a non-INVITE transaction to complete
    pub transaction_timeout_ms: u64,
    /// Maximum wait for the first INVITE response
    pub invite_timeout_ms: u64,
    /// Delay before re-sending after a 500 when the server gives no Retry-After
    pub retry_after_secs: u64,
}

/// Liveness monitoring thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    pub refresh_interval_secs: u64,
    pub options_threshold_secs: u64,
    pub burst_limit: u32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            realm: "asterisk".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 5060,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            user_agent: format!("sipagent {}", env!("CARGO_PKG_VERSION")),
            expires: 3600,
            allow: [
                "INVITE", "ACK", "CANCEL", "BYE", "NOTIFY", "REFER", "MESSAGE", "OPTIONS",
                "INFO", "SUBSCRIBE",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            transaction_timeout_ms: 9_000,
            invite_timeout_ms: 15_000,
            retry_after_secs: 5,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 125,
            options_threshold_secs: 15,
            burst_limit: 4,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `SIPAGENT__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, SipError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("SIPAGENT").separator("__"))
            .build()
            .map_err(|e| SipError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| SipError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, SipError> {
        let config: Config = toml::from_str(input).map_err(|e| SipError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SipError> {
        if self.account.username.is_empty() {
            return Err(SipError::Config("account.username is required".to_string()));
        }
        if self.account.server_host.is_empty() {
            return Err(SipError::Config("account.server_host is required".to_string()));
        }
        if self.agent.transaction_timeout_ms == 0 || self.agent.invite_timeout_ms == 0 {
            return Err(SipError::Config("transaction timeouts must be non-zero".to_string()));
        }
        if self.keepalive.enabled && self.keepalive.refresh_interval_secs == 0 {
            return Err(SipError::Config(
                "keepalive.refresh_interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the registrar
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.account.server_host, self.account.server_port)
    }

    pub fn bind_endpoint(&self) -> String {
        format!("{}:{}", self.agent.bind_address, self.agent.bind_port)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.transaction_timeout_ms)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.invite_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.agent.retry_after_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.refresh_interval_secs)
    }

    pub fn options_threshold(&self) -> Duration {
        Duration::from_secs(self.keepalive.options_threshold_secs)
    }
}
