//! Uploader configuration.
//!
//! Configuration arrives as a loosely typed [`RawConfig`] (every key optional,
//! deserializable from JSON or any other serde source) and is validated once
//! into an immutable [`UploaderConfig`]. Validation failures are fatal for the
//! whole upload and never show up as per-item errors.

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::dispatch::DispatchMode;
use crate::error::{ConfigError, Result};
use crate::retry::{RetryPolicy, WaitStrategy};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_COMPATIBILITY_LEVEL: u32 = 1113;
pub const DEFAULT_EXTENSION_IN_DAYS: u32 = 30;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRY: u32 = 10;

/// Target API environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Live,
    Sandbox,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Live => "https://api.ebay.com",
            Environment::Sandbox => "https://api.sandbox.ebay.com",
        }
    }
}

/// Unvalidated configuration as supplied by the caller.
///
/// Keys use kebab-case option names (`app-name`, `comp-level`, `max-retry`,
/// ...). Numeric options that are absent or zero fall back to their defaults.
/// Numeric and boolean options also accept their string spellings (`"5"`,
/// `"1"`, `"true"`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawConfig {
    pub app_name: Option<String>,
    pub cert_name: Option<String>,
    pub dev_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub siteid: Option<String>,
    pub auth_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub debug: Option<bool>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub concurrency: Option<usize>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub comp_level: Option<u32>,
    #[serde(default, alias = "ExtensionInDays", deserialize_with = "lenient_number")]
    pub extension_in_days: Option<u32>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub rewrite_index: Option<bool>,
    /// Per-request timeout in seconds
    #[serde(default, deserialize_with = "lenient_number")]
    pub timeout: Option<u64>,
    /// Maximum number of attempts per item
    #[serde(default, deserialize_with = "lenient_number")]
    pub max_retry: Option<u32>,
    /// Upper bound in seconds for the randomized wait between attempts
    #[serde(default, deserialize_with = "lenient_number")]
    pub random_wait: Option<u64>,
    pub mode: Option<DispatchMode>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub warning_fails_batch: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(i64),
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<StringOrNumber>::deserialize(deserializer)?.map(|value| match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }),
    )
}

/// Non-negative integer given as a number or a numeric string. An empty
/// string counts as absent.
fn lenient_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(StringOrNumber::Number(n)) => n,
        Some(StringOrNumber::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(StringOrNumber::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("expected a number, got {s:?}")))?,
    };
    let value = u64::try_from(value)
        .map_err(|_| D::Error::custom(format!("expected a non-negative number, got {value}")))?;
    T::try_from(value)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("number {value} is out of range")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Number(i64),
    String(String),
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<BoolLike>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match value {
        BoolLike::Bool(b) => Ok(Some(b)),
        BoolLike::Number(n) => Ok(Some(n != 0)),
        BoolLike::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(D::Error::custom(format!("expected a boolean, got {s:?}"))),
        },
    }
}

/// Auth token wrapper that keeps the secret out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Validated, immutable uploader configuration.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    app_name: String,
    cert_name: String,
    dev_name: String,
    site_id: String,
    auth_token: AuthToken,
    debug: bool,
    concurrency: usize,
    compatibility_level: u32,
    extension_in_days: u32,
    rewrite_index: bool,
    timeout: Duration,
    max_attempts: u32,
    random_wait: Option<Duration>,
    mode: DispatchMode,
    warning_fails_batch: bool,
}

fn required(value: Option<String>, field: &'static str) -> std::result::Result<String, ConfigError> {
    value.ok_or(ConfigError::MissingField(field))
}

fn non_zero<T: Default + PartialEq>(value: Option<T>, default: T) -> T {
    match value {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}

impl UploaderConfig {
    /// Validate a raw configuration.
    ///
    /// # Errors
    /// - [`ConfigError::MissingField`] if any of `app-name`, `cert-name`,
    ///   `dev-name`, `siteid`, `auth-token` is absent
    /// - [`ConfigError::InvalidSiteId`] if `siteid` is not made of digits only
    pub fn from_raw(raw: RawConfig) -> std::result::Result<Self, ConfigError> {
        let app_name = required(raw.app_name, "app-name")?;
        let cert_name = required(raw.cert_name, "cert-name")?;
        let dev_name = required(raw.dev_name, "dev-name")?;
        let site_id = required(raw.siteid, "siteid")?;
        let auth_token = required(raw.auth_token, "auth-token")?;

        if site_id.is_empty() || !site_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidSiteId(site_id));
        }
        if auth_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "auth-token",
                reason: "must not be empty".to_string(),
            });
        }

        let random_wait = match raw.random_wait {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        };

        Ok(Self {
            app_name,
            cert_name,
            dev_name,
            site_id,
            auth_token: AuthToken(auth_token),
            debug: raw.debug.unwrap_or(false),
            concurrency: non_zero(raw.concurrency, DEFAULT_CONCURRENCY),
            compatibility_level: non_zero(raw.comp_level, DEFAULT_COMPATIBILITY_LEVEL),
            extension_in_days: non_zero(raw.extension_in_days, DEFAULT_EXTENSION_IN_DAYS),
            rewrite_index: raw.rewrite_index.unwrap_or(true),
            timeout: Duration::from_secs(non_zero(raw.timeout, DEFAULT_TIMEOUT_SECS)),
            max_attempts: non_zero(raw.max_retry, DEFAULT_MAX_RETRY),
            random_wait,
            mode: raw.mode.unwrap_or_default(),
            warning_fails_batch: raw.warning_fails_batch.unwrap_or(false),
        })
    }

    /// Deserialize and validate a configuration from a JSON value.
    ///
    /// # Errors
    /// Every failure, including a value of the wrong type, is reported as
    /// [`VolleyError::Config`](crate::VolleyError::Config).
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Ok(Self::from_raw(raw)?)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn cert_name(&self) -> &str {
        &self.cert_name
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn compatibility_level(&self) -> u32 {
        self.compatibility_level
    }

    pub fn extension_in_days(&self) -> u32 {
        self.extension_in_days
    }

    pub fn rewrite_index(&self) -> bool {
        self.rewrite_index
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn warning_fails_batch(&self) -> bool {
        self.warning_fails_batch
    }

    /// Retry policy derived from `max-retry` and `random-wait`.
    pub fn retry_policy(&self) -> RetryPolicy {
        let wait = match self.random_wait {
            Some(max) => WaitStrategy::Random { max },
            None => WaitStrategy::Fixed(Duration::ZERO),
        };
        RetryPolicy::new(self.max_attempts, wait)
    }
}
