use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub max_request_duration: Duration,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
}

/// Provider call settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub cache_control: CacheControlMode,
    /// Provider round-trips allowed per request; each tool-using step costs one.
    pub max_tool_turns: u32,
    pub max_tokens: u32,
    pub display: DisplaySize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControlMode {
    Ephemeral,
    Off,
}

impl FromStr for CacheControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(Self::Ephemeral),
            "off" | "none" | "disabled" => Ok(Self::Off),
            other => Err(format!("expected 'ephemeral' or 'off', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub template: String,
    pub timeout: Duration,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let llm = LlmConfig {
            api_key: env.required("ANTHROPIC_API_KEY")?,
            base_url: env
                .optional("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model: env
                .optional("COMPUTER_USE_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            cache_control: env.parsed("COMPUTER_USE_CACHE_CONTROL", CacheControlMode::Ephemeral)?,
            max_tool_turns: env.parsed("COMPUTER_USE_MAX_TOOL_TURNS", 8)?,
            max_tokens: env.parsed("COMPUTER_USE_MAX_TOKENS", 4096)?,
            display: DisplaySize {
                width: env.parsed("DISPLAY_WIDTH", 1024)?,
                height: env.parsed("DISPLAY_HEIGHT", 768)?,
            },
        };
        if llm.max_tool_turns == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COMPUTER_USE_MAX_TOOL_TURNS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let sandbox = SandboxConfig {
            api_url: env.required("SANDBOX_API_URL")?,
            api_key: env.optional("SANDBOX_API_KEY"),
            template: env
                .optional("SANDBOX_TEMPLATE")
                .unwrap_or_else(|| "desktop".to_string()),
            timeout: Duration::from_secs(env.parsed("SANDBOX_TIMEOUT_SECS", 300)?),
        };

        Ok(Self {
            bind_addr: env.parsed("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            max_request_duration: Duration::from_secs(
                env.parsed("MAX_REQUEST_DURATION_SECS", 300)?,
            ),
            llm,
            sandbox,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = AppConfig::from_lookup(lookup(&[
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("SANDBOX_API_URL", "http://sandbox.local"),
        ]))
        .unwrap();

        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.cache_control, CacheControlMode::Ephemeral);
        assert_eq!(config.llm.max_tool_turns, 8);
        assert_eq!(config.llm.display, DisplaySize { width: 1024, height: 768 });
        assert_eq!(config.max_request_duration, Duration::from_secs(300));
        assert_eq!(config.bind_addr.port(), 3000);
        assert!(config.sandbox.api_key.is_none());
    }

    #[test]
    fn missing_api_key_is_reported_by_name() {
        let err = AppConfig::from_lookup(lookup(&[("SANDBOX_API_URL", "http://sandbox.local")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("SANDBOX_API_URL", "http://sandbox.local"),
            ("COMPUTER_USE_MAX_TOOL_TURNS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "COMPUTER_USE_MAX_TOOL_TURNS"
        ));
    }

    #[test]
    fn cache_control_can_be_disabled() {
        let config = AppConfig::from_lookup(lookup(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("SANDBOX_API_URL", "http://sandbox.local"),
            ("COMPUTER_USE_CACHE_CONTROL", "off"),
        ]))
        .unwrap();
        assert_eq!(config.llm.cache_control, CacheControlMode::Off);
    }
}
