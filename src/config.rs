//! Configuration management for Turnstile.
//!
//! Settings are layered, later sources winning: built-in defaults, an
//! optional YAML file, `TURNSTILE__SECTION__KEY` environment variables, and
//! finally the flat variables understood by earlier deployments
//! (`RATE_LIMIT_IP`, `RATE_LIMIT_TOKEN`, `BLOCK_TIME`, `REDIS_ADDRESS`, ...).
//! Any of these variables may also come from a `.env` file, see
//! [`load_env_file`].

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    AdmissionOrder, LimiterConfig, DEFAULT_ADDRESS_LIMIT, DEFAULT_BLOCK_DURATION,
    DEFAULT_TOKEN_LIMIT,
};

/// Flat environment variables and the config keys they override.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("limits.address_limit", "RATE_LIMIT_IP"),
    ("limits.token_limit", "RATE_LIMIT_TOKEN"),
    ("limits.block_time", "BLOCK_TIME"),
    ("storage.backend", "STORAGE_BACKEND"),
    ("storage.redis_address", "REDIS_ADDRESS"),
    ("server.listen_addr", "LISTEN_ADDR"),
];

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission thresholds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Admission thresholds and blocking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests admitted per address before blocking
    #[serde(default = "default_address_limit")]
    pub address_limit: u64,

    /// Requests admitted per `API_KEY` token before blocking
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// How long a tripped identifier stays blocked
    #[serde(
        default = "default_block_time",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub block_time: Duration,

    /// Counter read/write ordering
    #[serde(default)]
    pub order: AdmissionOrder,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            address_limit: default_address_limit(),
            token_limit: default_token_limit(),
            block_time: default_block_time(),
            order: AdmissionOrder::default(),
        }
    }
}

fn default_address_limit() -> u64 {
    DEFAULT_ADDRESS_LIMIT
}

fn default_token_limit() -> u64 {
    DEFAULT_TOKEN_LIMIT
}

fn default_block_time() -> Duration {
    DEFAULT_BLOCK_DURATION
}

/// Which counter store to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local map; counts are not shared between instances
    Memory,
    /// Redis server shared by every instance
    #[default]
    Redis,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "redis" => Ok(StorageBackend::Redis),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis `host:port` or `redis://` URL
    #[serde(default = "default_redis_address")]
    pub redis_address: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_address: default_redis_address(),
        }
    }
}

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("TURNSTILE").separator("__"));

        Self::build(builder, |name| std::env::var(name).ok())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(
            Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)),
            |_| None,
        )
    }

    fn build<F>(mut builder: ConfigBuilder<DefaultState>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, var) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, lookup(var))?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// The decision core's view of this configuration.
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            token_limit: self.limits.token_limit,
            address_limit: self.limits.address_limit,
            block_duration: self.limits.block_time,
            order: self.limits.order,
        }
    }
}

/// Load variables from a dotenv file into the process environment.
///
/// Variables already set in the environment win over the file. A missing
/// file is not an error and returns `false`; a malformed one is. Nothing is
/// logged here since this normally runs before tracing is installed.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(TurnstileError::Config(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Nanoseconds per duration unit, as accepted by Go's `time.ParseDuration`.
const DURATION_UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{b5}s", 1_000),
    ("\u{3bc}s", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
];

/// Parse durations such as `300us`, `500ms`, `1.5s`, `5m`, `1h`, `1m0.5s`,
/// or a bare number of seconds.
///
/// Values too large to hold in a `Duration` of `u64` seconds are rejected.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let invalid = || format!("invalid duration: {}", input);
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut nanos: u128 = 0;
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest.is_empty() {
        return Err(invalid());
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];

        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_dot.len());
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let scale = DURATION_UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| format!("unknown duration unit {:?} in {}", unit, input))?;
        rest = &rest[unit_len..];

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        // Digits past nanosecond precision are dropped
        let frac_digits = &frac_part[..frac_part.len().min(18)];
        let frac: u128 = if frac_digits.is_empty() {
            0
        } else {
            let value: u128 = frac_digits.parse().map_err(|_| invalid())?;
            value * scale / 10u128.pow(frac_digits.len() as u32)
        };

        nanos = whole
            .checked_mul(scale)
            .and_then(|n| n.checked_add(frac))
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(|| format!("duration out of range: {}", input))?;
    }

    let secs = u64::try_from(nanos / 1_000_000_000)
        .map_err(|_| format!("duration out of range: {}", input))?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration like \"5m\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}
