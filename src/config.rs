use std::{path::PathBuf, str::FromStr};

use tokio::time::Duration;
use url::Url;

use crate::{
    resolver::ResolverConfig,
    retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_RETRIES, RetryPolicy},
};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_PROXY_PROVIDER_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_MEDIA_CONNECT_TIMEOUT_SECONDS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// What to do when the proxied routes cannot obtain a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyPolicy {
    /// Fail the request with "Failed to get proxy".
    #[default]
    Required,
    /// Log and reach the platform directly.
    Direct,
}

impl FromStr for ProxyPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "required" | "fail" | "strict" => Ok(Self::Required),
            "direct" | "fallback" | "optional" => Ok(Self::Direct),
            other => Err(format!("expected `required` or `direct`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub retry: RetryPolicy,
    pub proxy_policy: ProxyPolicy,
    pub max_concurrent_downloads: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub provider_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub service: ServiceConfig,
    pub resolver: ResolverConfig,
    pub proxy: Option<ProxyConfig>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_var_string)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = match (lookup("APP_ADDR"), lookup("PORT")) {
            (Some(addr), _) => addr,
            (None, Some(port)) => {
                let port: u16 = parse_value("PORT", &port)?;
                format!("0.0.0.0:{port}")
            }
            (None, None) => DEFAULT_BIND_ADDR.to_string(),
        };

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let retry = RetryPolicy {
            max_retries: parse_optional(&lookup, "MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: Duration::from_millis(
                parse_optional(&lookup, "RETRY_BASE_DELAY_MS")?.unwrap_or(DEFAULT_BASE_DELAY_MS),
            ),
        };
        let max_concurrent_downloads = parse_optional::<usize>(&lookup, "MAX_CONCURRENT_DOWNLOADS")?
            .filter(|value| *value > 0);
        let proxy_policy = parse_optional(&lookup, "PROXY_POLICY")?.unwrap_or_default();

        let resolver = ResolverConfig {
            yt_dlp_bin: lookup("YT_DLP_BIN").unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            metadata_timeout: Duration::from_secs(
                parse_optional(&lookup, "YT_DLP_TIMEOUT_SECONDS")?
                    .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ),
            connect_timeout: Duration::from_secs(
                parse_optional(&lookup, "MEDIA_CONNECT_TIMEOUT_SECONDS")?
                    .unwrap_or(DEFAULT_MEDIA_CONNECT_TIMEOUT_SECONDS),
            ),
            user_agent: lookup("YT_USER_AGENT"),
            cookie: lookup("YT_COOKIE"),
            cookies_file: lookup("YT_COOKIES_FILE").map(PathBuf::from),
        };

        let proxy = match lookup("PROXY_PROVIDER_URL") {
            Some(raw) => Some(ProxyConfig {
                provider_url: parse_value("PROXY_PROVIDER_URL", &raw)?,
                timeout: Duration::from_secs(
                    parse_optional(&lookup, "PROXY_PROVIDER_TIMEOUT_SECONDS")?
                        .unwrap_or(DEFAULT_PROXY_PROVIDER_TIMEOUT_SECONDS),
                ),
            }),
            None => None,
        };

        Ok(Self {
            bind_addr,
            allowed_origins,
            service: ServiceConfig {
                retry,
                proxy_policy,
                max_concurrent_downloads,
            },
            resolver,
            proxy,
        })
    }
}

fn env_var_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| parse_value(name, &value))
        .transpose()
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|error: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: error.to_string(),
    })
}
