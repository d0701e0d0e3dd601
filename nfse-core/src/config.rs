//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// National NFSe environment.
///
/// - Staging: what the national portal calls "Producao Restrita". Documents
///   issued here carry `tpAmb = 2` and have no fiscal effect.
/// - Production: the live environment (`tpAmb = 1`).
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use nfse_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("homologacao")?;
/// assert_eq!(env, EnvironmentType::Staging);
/// # Ok::<(), nfse_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Staging,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "staging" | "homologacao" | "producao_restrita" => Ok(EnvironmentType::Staging),
            "production" | "producao" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Staging => "staging",
            EnvironmentType::Production => "production",
        }
    }

    /// Value of the `tpAmb` element.
    pub fn tp_amb(&self) -> u8 {
        match self {
            EnvironmentType::Production => 1,
            EnvironmentType::Staging => 2,
        }
    }

    /// Issuing API (SEFIN Nacional) base URL.
    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Staging => {
                "https://sefin.producaorestrita.nfse.gov.br/SefinNacional/"
            }
            EnvironmentType::Production => "https://sefin.nfse.gov.br/SefinNacional/",
        }
    }

    /// National data environment (ADN) base URL, used for DANFSe downloads.
    pub fn danfse_url(&self) -> &'static str {
        match self {
            EnvironmentType::Staging => "https://adn.producaorestrita.nfse.gov.br/",
            EnvironmentType::Production => "https://adn.nfse.gov.br/",
        }
    }
}

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Bounded exponential backoff settings for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts every attempt, the first one included. Zero is
    /// treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the protocol client and XSD validation.
///
/// # Examples
/// ```rust
/// use nfse_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Staging)
///     .with_xsd_path("schemas/DPS_v1.00.xsd");
/// assert_eq!(config.env(), EnvironmentType::Staging);
/// ```
#[derive(Clone)]
pub struct Config {
    env: EnvironmentType,
    base_url: Option<String>,
    danfse_base_url: Option<String>,
    xsd_path: Option<PathBuf>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    application_version: String,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            base_url: None,
            danfse_base_url: None,
            xsd_path: None,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            application_version: crate::dps::xml::DEFAULT_APPLICATION_VERSION.to_string(),
        }
    }

    /// Load configuration from `NFSE_*` environment variables.
    ///
    /// Unset variables keep their defaults; `NFSE_ENVIRONMENT` defaults to staging.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = match std::env::var("NFSE_ENVIRONMENT") {
            Ok(value) => EnvironmentType::from_str(&value)?,
            Err(_) => EnvironmentType::Staging,
        };
        let mut config = Config::new(env);

        if let Ok(url) = std::env::var("NFSE_SEFIN_BASE_URL") {
            config = config.with_base_url(url);
        }
        if let Ok(url) = std::env::var("NFSE_ADN_BASE_URL") {
            config = config.with_danfse_base_url(url);
        }
        if let Ok(path) = std::env::var("NFSE_XSD_PATH") {
            config = config.with_xsd_path(path);
        }
        if let Ok(value) = std::env::var("NFSE_MAX_ATTEMPTS") {
            let attempts = value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "NFSE_MAX_ATTEMPTS",
                    value,
                })?;
            config.retry = RetryPolicy {
                max_attempts: attempts,
                ..config.retry
            };
        }
        if let Ok(value) = std::env::var("NFSE_TIMEOUT_SECS") {
            let secs = value
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "NFSE_TIMEOUT_SECS",
                    value,
                })?;
            config.retry = config
                .retry
                .with_attempt_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(normalize_base_url(url.into()));
        self
    }

    pub fn with_danfse_base_url(mut self, url: impl Into<String>) -> Self {
        self.danfse_base_url = Some(normalize_base_url(url.into()));
        self
    }

    pub fn with_xsd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.xsd_path = Some(path.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_application_version(mut self, version: impl Into<String>) -> Self {
        self.application_version = version.into();
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    /// Issuing API base URL, always ending in `/`.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.env.endpoint_url())
    }

    /// DANFSe download base URL, always ending in `/`.
    pub fn danfse_base_url(&self) -> &str {
        self.danfse_base_url
            .as_deref()
            .unwrap_or_else(|| self.env.danfse_url())
    }

    pub fn xsd_path(&self) -> Option<&Path> {
        self.xsd_path.as_deref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn application_version(&self) -> &str {
        &self.application_version
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::Staging)
    }
}

// Base URLs may carry credentials in userinfo when pointed at a proxy.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("env", &self.env)
            .field("base_url", &redact_userinfo(self.base_url()))
            .field("danfse_base_url", &redact_userinfo(self.danfse_base_url()))
            .field("xsd_path", &self.xsd_path)
            .field("retry", &self.retry)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_version", &self.application_version)
            .finish()
    }
}

fn normalize_base_url(value: String) -> String {
    if value.ends_with('/') {
        value
    } else {
        format!("{value}/")
    }
}

fn redact_userinfo(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://[REDACTED]@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}
