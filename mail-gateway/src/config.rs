use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const REPUTATION_API_KEY_ENV: &str = "GATEWAY_REPUTATION_API_KEY";
pub const SCANNER_API_KEY_ENV: &str = "GATEWAY_SCANNER_API_KEY";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub validation: ValidationConfig,
    pub reputation: ReputationConfig,
    pub scanner: ScannerConfig,
    pub directory: DirectoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub domain: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Domain whose mail skips SPF (from 127.0.0.1) and DKIM checks.
    /// Unset in production.
    pub bypass_domain: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub api_url: String,
    pub api_key: String,
    pub max_age_days: u32,
    pub score_threshold: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub api_url: String,
    pub api_key: String,
    pub upload_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| GatewayError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Fill empty API keys from the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.reputation.api_key.is_empty() {
            if let Some(key) = lookup(REPUTATION_API_KEY_ENV) {
                self.reputation.api_key = key;
            }
        }
        if self.scanner.api_key.is_empty() {
            if let Some(key) = lookup(SCANNER_API_KEY_ENV) {
                self.scanner.api_key = key;
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            hostname: "mail.localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_recipients: 100,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.abuseipdb.com/api/v2/check".to_string(),
            api_key: String::new(),
            max_age_days: 90,
            score_threshold: 50,
            timeout_secs: 10,
        }
    }
}

impl ReputationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://www.virustotal.com/api/v3".to_string(),
            api_key: String::new(),
            upload_timeout_secs: 30,
            poll_timeout_secs: 10,
            poll_interval_ms: 5000,
            max_polls: 12,
        }
    }
}

impl ScannerConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
