//! Configuration for the ZTP notification client.
//!
//! TOML file at the platform config dir, `ZTP_`-prefixed environment
//! overrides, and translation into [`ztp_notify::ClientConfig`] plus the
//! base service address.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use ztp_notify::{ClientConfig, DEFAULT_ENDPOINT_PATH, ReconnectConfig, derive_endpoint};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Where the provisioning server lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSection {
    /// Base HTTP(S) address, e.g. "https://ztp.example.net".
    pub base_url: Option<String>,

    /// Channel path appended to the base address.
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            base_url: None,
            endpoint_path: default_endpoint_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// `0` retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Buffered lifecycle events per observer.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_endpoint_path() -> String {
    DEFAULT_ENDPOINT_PATH.into()
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_event_channel_capacity() -> usize {
    64
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validated base address. The channel endpoint must be derivable
    /// from it, so only http(s)/ws(s) schemes pass.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .service
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::validation("service.base_url", "not set"))?;

        let url: Url = raw.parse().map_err(|e| {
            ConfigError::validation("service.base_url", format!("invalid URL '{raw}': {e}"))
        })?;

        derive_endpoint(&url, &self.service.endpoint_path)
            .map_err(|e| ConfigError::validation("service.base_url", e.to_string()))?;
        Ok(url)
    }

    /// Build the runtime client configuration.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let section = &self.reconnect;

        if self.service.endpoint_path.trim().is_empty() {
            return Err(ConfigError::validation("service.endpoint_path", "must not be empty"));
        }
        if section.initial_delay_ms == 0 {
            return Err(ConfigError::validation(
                "reconnect.initial_delay_ms",
                "must be greater than zero",
            ));
        }
        if section.max_delay_ms < section.initial_delay_ms {
            return Err(ConfigError::validation(
                "reconnect.max_delay_ms",
                format!(
                    "{} is below initial_delay_ms ({})",
                    section.max_delay_ms, section.initial_delay_ms
                ),
            ));
        }
        if section.event_channel_capacity == 0 {
            return Err(ConfigError::validation(
                "reconnect.event_channel_capacity",
                "must be greater than zero",
            ));
        }

        Ok(ClientConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(section.initial_delay_ms),
                max_delay: Duration::from_millis(section.max_delay_ms),
                max_attempts: (section.max_attempts > 0).then_some(section.max_attempts),
            },
            endpoint_path: self.service.endpoint_path.clone(),
            lifecycle_capacity: section.event_channel_capacity,
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "ztp", "ztp-notify").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("ztp-notify");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path.as_ref()))
        .merge(Env::prefixed("ZTP_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning the defaults if anything goes wrong.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(config_path(), cfg)
}

pub fn save_config_to(path: impl AsRef<Path>, cfg: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_base(base: &str) -> Config {
        Config {
            service: ServiceSection {
                base_url: Some(base.into()),
                ..ServiceSection::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_client_defaults() {
        let client = Config::default().client_config().unwrap();
        assert_eq!(client, ClientConfig::default());
    }

    #[test]
    fn zero_attempts_means_forever() {
        let mut cfg = Config::default();
        cfg.reconnect.max_attempts = 0;
        assert_eq!(cfg.client_config().unwrap().reconnect.max_attempts, None);
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let err = Config::default().base_url().unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { ref field, .. } if field == "service.base_url")
        );
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(with_base("ftp://ztp.local").base_url().is_err());
        assert!(with_base("not a url").base_url().is_err());
        assert_eq!(
            with_base("https://ztp.local/api").base_url().unwrap().as_str(),
            "https://ztp.local/api"
        );
    }

    #[test]
    fn inverted_delays_are_rejected() {
        let mut cfg = Config::default();
        cfg.reconnect.max_delay_ms = 500;
        let err = cfg.client_config().unwrap_err();
        assert!(err.to_string().contains("reconnect.max_delay_ms"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = Config::default();
        cfg.reconnect.event_channel_capacity = 0;
        assert!(cfg.client_config().is_err());
    }
}
