//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use repcache_client::RetryPolicy;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{
    CacheConfig, DEFAULT_ERROR_THRESHOLD, DEFAULT_MEMORY_CAPACITY, DEFAULT_OPERATION_TIMEOUT,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "repcache";
const ENV_PREFIX: &str = "REPCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONNECT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_CONNECT_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_CONNECT_BACKOFF_CAP_MS: u64 = 3_000;
const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ORIGIN_TIMEOUT_MS: u64 = 30_000;

/// Command-line arguments for the repcache binary.
#[derive(Debug, Parser)]
#[command(name = "repcache", version, about = "Resilient read-through cache proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "REPCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy in front of the configured origin.
    Serve(Box<ServeArgs>),
    /// List cached keys.
    Keys(KeysArgs),
    /// Delete one key or every key under a prefix.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the primary Redis URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the fallback KV base URL.
    #[arg(long = "kv-url", value_name = "URL")]
    pub kv_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the origin base URL.
    #[arg(long = "origin-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub origin_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Skip the cache entirely and tag responses `DEV-MODE`.
    #[arg(
        long = "dev-mode",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub dev_mode: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct KeysArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Only list keys starting with this prefix.
    #[arg(long, value_name = "PREFIX", default_value = "")]
    pub prefix: String,
}

#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Exact key to delete.
    #[arg(value_name = "KEY")]
    pub key: Option<String>,

    /// Delete every key starting with this prefix.
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub primary: Option<PrimarySettings>,
    pub fallback: FallbackSettings,
    pub origin: OriginSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Redis primary. Absent when no URL is configured.
#[derive(Debug, Clone)]
pub struct PrimarySettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub connect_max_attempts: NonZeroU32,
    pub connect_backoff_base: Duration,
    pub connect_backoff_cap: Duration,
    pub error_threshold: NonZeroU32,
    /// Per-call budget; must leave room for the fallback inside one lookup.
    pub operation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub base_url: Option<Url>,
    pub token: Option<String>,
    pub request_timeout: Duration,
    /// Append the in-process store after the remote backends.
    pub in_memory: bool,
    /// Most entries the in-process store keeps before evicting.
    pub memory_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub base_url: Option<Url>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(args),
        Some(Command::Keys(args)) => raw.apply_store_overrides(&args.stores),
        Some(Command::Purge(args)) => raw.apply_store_overrides(&args.stores),
        None => raw.apply_serve_overrides(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: CacheConfig,
    primary: RawPrimarySettings,
    fallback: RawFallbackSettings,
    origin: RawOriginSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeArgs) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.base_url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dev_mode) = overrides.dev_mode {
            self.cache.dev_mode = dev_mode;
        }

        self.apply_store_overrides(&overrides.stores);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.redis_url.as_ref() {
            self.primary.url = Some(url.clone());
        }
        if let Some(url) = overrides.kv_url.as_ref() {
            self.fallback.base_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            primary,
            fallback,
            origin,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = validate_cache_config(cache)?;
        let primary = build_primary_settings(primary, &cache)?;
        let fallback = build_fallback_settings(fallback)?;
        let origin = build_origin_settings(origin)?;

        Ok(Self {
            server,
            logging,
            cache,
            primary,
            fallback,
            origin,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn validate_cache_config(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.ttl_minutes == 0 {
        return Err(LoadError::invalid(
            "cache.ttl_minutes",
            "must be greater than zero",
        ));
    }
    if cache.lookup_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lookup_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.write_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.write_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.key_prefix.trim().is_empty() {
        return Err(LoadError::invalid("cache.key_prefix", "must not be empty"));
    }
    if cache.bypass_header.is_empty()
        || axum::http::HeaderName::from_bytes(cache.bypass_header.as_bytes()).is_err()
    {
        return Err(LoadError::invalid(
            "cache.bypass_header",
            format!("`{}` is not a valid header name", cache.bypass_header),
        ));
    }
    Ok(cache)
}

fn build_primary_settings(
    primary: RawPrimarySettings,
    cache: &CacheConfig,
) -> Result<Option<PrimarySettings>, LoadError> {
    let Some(url) = non_blank(primary.url) else {
        return Ok(None);
    };

    let connect_max_attempts = non_zero_u32(
        primary
            .connect_max_attempts
            .unwrap_or(DEFAULT_CONNECT_MAX_ATTEMPTS),
        "primary.connect_max_attempts",
    )?;
    let error_threshold = non_zero_u32(
        primary
            .error_threshold
            .unwrap_or(u64::from(DEFAULT_ERROR_THRESHOLD)),
        "primary.error_threshold",
    )?;

    let connect_backoff_base = Duration::from_millis(
        primary
            .connect_backoff_base_ms
            .unwrap_or(DEFAULT_CONNECT_BACKOFF_BASE_MS),
    );
    let connect_backoff_cap = Duration::from_millis(
        primary
            .connect_backoff_cap_ms
            .unwrap_or(DEFAULT_CONNECT_BACKOFF_CAP_MS),
    );
    if connect_backoff_cap < connect_backoff_base {
        return Err(LoadError::invalid(
            "primary.connect_backoff_cap_ms",
            "must not be smaller than connect_backoff_base_ms",
        ));
    }

    let operation_timeout = primary
        .operation_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_OPERATION_TIMEOUT);
    if operation_timeout.is_zero() || operation_timeout >= cache.lookup_timeout() {
        return Err(LoadError::invalid(
            "primary.operation_timeout_ms",
            format!(
                "must be between 1 and {} (cache.lookup_timeout_ms) exclusive",
                cache.lookup_timeout_ms
            ),
        ));
    }

    Ok(Some(PrimarySettings {
        url,
        connect_timeout: Duration::from_millis(
            primary
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        ),
        connect_max_attempts,
        connect_backoff_base,
        connect_backoff_cap,
        error_threshold,
        operation_timeout,
    }))
}

fn build_fallback_settings(fallback: RawFallbackSettings) -> Result<FallbackSettings, LoadError> {
    let base_url = non_blank(fallback.base_url)
        .map(|raw| parse_base_url(&raw, "fallback.base_url"))
        .transpose()?;

    let memory_capacity = match fallback.memory_capacity {
        Some(raw) => usize::try_from(raw)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| LoadError::invalid("fallback.memory_capacity", "must be greater than zero"))?,
        None => DEFAULT_MEMORY_CAPACITY,
    };

    Ok(FallbackSettings {
        base_url,
        token: non_blank(fallback.token),
        request_timeout: Duration::from_millis(
            fallback
                .request_timeout_ms
                .unwrap_or(DEFAULT_FALLBACK_TIMEOUT_MS),
        ),
        in_memory: fallback.in_memory.unwrap_or(false),
        memory_capacity,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let base_url = non_blank(origin.base_url)
        .map(|raw| parse_base_url(&raw, "origin.base_url"))
        .transpose()?;

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_retries: origin.max_retries.unwrap_or(defaults.max_retries),
        retry_delay_ms: origin.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
        retryable_status_codes: origin
            .retryable_status_codes
            .unwrap_or(defaults.retryable_status_codes),
    };
    if let Some(code) = retry
        .retryable_status_codes
        .iter()
        .find(|code| !(100..=599).contains(*code))
    {
        return Err(LoadError::invalid(
            "origin.retryable_status_codes",
            format!("{code} is not an HTTP status code"),
        ));
    }

    Ok(OriginSettings {
        base_url,
        request_timeout: Duration::from_millis(
            origin
                .request_timeout_ms
                .unwrap_or(DEFAULT_ORIGIN_TIMEOUT_MS),
        ),
        retry,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrimarySettings {
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
    connect_max_attempts: Option<u64>,
    connect_backoff_base_ms: Option<u64>,
    connect_backoff_cap_ms: Option<u64>,
    error_threshold: Option<u64>,
    operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFallbackSettings {
    base_url: Option<String>,
    token: Option<String>,
    request_timeout_ms: Option<u64>,
    in_memory: Option<bool>,
    memory_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    base_url: Option<String>,
    request_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    retryable_status_codes: Option<Vec<u16>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_base_url(raw: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(raw).map_err(|err| LoadError::invalid(key, format!("{raw}: {err}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, format!("{raw} is not an http(s) base URL")));
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
