//! Gateway configuration.
//!
//! A [`WebhookConfig`] is read once at startup (usually from a TOML file) and
//! shared read-only afterwards. `${VAR}` references are expanded from the
//! environment before parsing so secrets can stay out of the file.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::verification::SignatureScheme;

const DEFAULT_PATH_PREFIX: &str = "/webhook/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Publicly reachable base URL the provider is told about. Falls back to
    /// the bound socket address when unset.
    #[serde(default)]
    pub external_base_url: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    /// Route the listener serves. A hashed default is derived when unset.
    #[serde(default)]
    pub path: Option<String>,
    /// Extra input for the hashed default path.
    #[serde(default)]
    pub path_seed: Option<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub signature: SignatureScheme,
    #[serde(default = "default_true")]
    pub auto_register: bool,
    /// Answer 504 instead of acknowledging when the pipeline outcome is not
    /// known within `ack_timeout_ms`.
    #[serde(default)]
    pub sync_ack: bool,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_ack_status")]
    pub ack_status: u16,
    #[serde(default)]
    pub ack_body: String,
    #[serde(default = "default_busy_status")]
    pub busy_status: u16,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    #[serde(default = "default_unregister_timeout_ms")]
    pub unregister_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Generic REST registration adapter, used by the binary.
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub registration_url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

fn default_ack_timeout_ms() -> u64 {
    1_000
}

fn default_ack_status() -> u16 {
    200
}

fn default_busy_status() -> u16 {
    503
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_in_flight() -> usize {
    256
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_drain_grace_ms() -> u64 {
    10_000
}

fn default_unregister_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_provider_timeout_secs() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            external_base_url: None,
            base_path: None,
            path: None,
            path_seed: None,
            methods: default_methods(),
            secret: None,
            signature: SignatureScheme::default(),
            auto_register: true,
            sync_ack: false,
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_status: default_ack_status(),
            ack_body: String::new(),
            busy_status: default_busy_status(),
            max_body_size: default_max_body_size(),
            max_connections: default_max_connections(),
            max_in_flight: default_max_in_flight(),
            bind_address: default_bind_address(),
            drain_grace_ms: default_drain_grace_ms(),
            unregister_timeout_ms: default_unregister_timeout_ms(),
            retry: RetryConfig::default(),
            provider: None,
        }
    }
}

impl WebhookConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Parse and validate TOML content.
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content)?;
        let config: WebhookConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            validate_path("path", path)?;
        }
        if let Some(base) = &self.base_path {
            validate_path("base_path", base)?;
        }
        self.allowed_methods()?;

        if !(200..300).contains(&self.ack_status) {
            return Err(ConfigError::invalid("ack_status", "must be a 2xx status"));
        }
        if self.busy_status != 429 && self.busy_status != 503 {
            return Err(ConfigError::invalid("busy_status", "must be 429 or 503"));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::invalid("max_body_size", "must be positive"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections", "must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("max_in_flight", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be positive"));
        }
        if let Some(raw) = &self.external_base_url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| ConfigError::invalid("external_base_url", e.to_string()))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::invalid(
                    "external_base_url",
                    "scheme must be http or https",
                ));
            }
        }
        if matches!(&self.secret, Some(s) if s.is_empty()) {
            return Err(ConfigError::invalid("secret", "must not be empty when set"));
        }
        Ok(())
    }

    pub fn allowed_methods(&self) -> Result<Vec<Method>, ConfigError> {
        if self.methods.is_empty() {
            return Err(ConfigError::invalid("methods", "at least one method is required"));
        }
        self.methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| ConfigError::invalid("methods", format!("unknown method {m}")))
            })
            .collect()
    }

    /// Path the listener serves, including `base_path`.
    pub fn full_path(&self) -> String {
        let path = match &self.path {
            Some(p) => normalize_path(p),
            None => self.default_path(),
        };
        match self.base_path.as_deref().map(str::trim) {
            Some(base) if !base.is_empty() && base != "/" => {
                format!("{}{}", normalize_path(base).trim_end_matches('/'), path)
            }
            _ => path,
        }
    }

    /// Public URL handed to the provider.
    pub fn callback_url(&self, local_addr: SocketAddr) -> String {
        let base = match &self.external_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{local_addr}"),
        };
        format!("{base}{}", self.full_path())
    }

    fn default_path(&self) -> String {
        let seed = format!(
            "{}|{}",
            self.external_base_url.as_deref().unwrap_or_default(),
            self.path_seed.as_deref().unwrap_or_default()
        );
        let digest = hex::encode(Sha256::digest(seed.as_bytes()));
        format!("{DEFAULT_PATH_PREFIX}{}", &digest[..16])
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_millis(self.unregister_timeout_ms)
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn validate_path(field: &str, path: &str) -> Result<(), ConfigError> {
    if path.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if path.contains(['{', '}', '*', '?', '#', ' ']) {
        return Err(ConfigError::invalid(field, "contains reserved characters"));
    }
    // Router syntax from older axum versions; rejected when routes are built.
    if path.split('/').any(|segment| segment.starts_with(':')) {
        return Err(ConfigError::invalid(field, "segments must not start with ':'"));
    }
    Ok(())
}

/// Expand environment variables in the format `${VAR}`.
fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::invalid("env expansion", e.to_string()))?;
    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }
    Ok(result)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
