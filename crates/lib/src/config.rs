//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parlor/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Runtime environment; decides whether error envelopes carry real error text.
    #[serde(default)]
    pub environment: Environment,

    /// Chat client defaults.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require `?token=` on /cable.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for cable connections. Overridden by PARLOR_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the token query parameter to match the configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Runtime environment. Production is the default so error text is redacted unless asked otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    #[default]
    Production,
}

impl Environment {
    /// Development and test may see real error messages; everything else gets the generic text.
    pub fn is_development_like(self) -> bool {
        matches!(self, Environment::Development | Environment::Test)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

/// Chat client settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Cable URL (e.g. "ws://127.0.0.1:15152/cable"). Defaults to the gateway bind and port.
    pub url: Option<String>,
    /// User name presented to the gateway.
    pub user: Option<String>,
    /// When set, error reports are appended here as JSON lines instead of only being logged.
    pub diagnostics_path: Option<PathBuf>,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env PARLOR_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("PARLOR_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the environment: env PARLOR_ENV overrides config. An unparseable value is logged and ignored.
pub fn resolve_environment(config: &Config) -> Environment {
    match non_empty_env("PARLOR_ENV").map(|s| s.parse::<Environment>()) {
        Some(Ok(env)) => env,
        Some(Err(e)) => {
            log::warn!("ignoring PARLOR_ENV: {}", e);
            config.environment
        }
        None => config.environment,
    }
}

/// Cable URL for clients: `client.url` when set, otherwise derived from the gateway bind and port.
pub fn resolve_cable_url(config: &Config) -> String {
    config
        .client
        .url
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            format!(
                "ws://{}:{}/cable",
                config.gateway.bind.trim(),
                config.gateway.port
            )
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLOR_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parlor").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or PARLOR_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 15152);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn default_environment_is_production() {
        let config = Config::default();
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.environment.is_development_like());
    }

    #[test]
    fn parse_camel_case_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "gateway": { "port": 9000, "auth": { "mode": "token", "token": " s3cret " } },
                "environment": "development",
                "client": { "user": "ada", "diagnosticsPath": "/tmp/diag.jsonl" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.auth.mode, GatewayAuthMode::Token);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.client.user.as_deref(), Some("ada"));
        assert_eq!(
            config.client.diagnostics_path,
            Some(PathBuf::from("/tmp/diag.jsonl"))
        );
    }

    #[test]
    fn environment_from_str() {
        assert_eq!("dev".parse::<Environment>(), Ok(Environment::Development));
        assert_eq!(" Test ".parse::<Environment>(), Ok(Environment::Test));
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Production));
        assert!("staging".parse::<Environment>().is_err());
        assert!(Environment::Test.is_development_like());
    }

    #[test]
    fn cable_url_defaults_to_gateway_address() {
        let mut config = Config::default();
        config.gateway.port = 4000;
        assert_eq!(resolve_cable_url(&config), "ws://127.0.0.1:4000/cable");
        config.client.url = Some("wss://chat.example.com/cable".into());
        assert_eq!(resolve_cable_url(&config), "wss://chat.example.com/cable");
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }
}
