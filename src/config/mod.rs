//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, StoreBackend, TagMode};

mod cli;

pub use cli::{BuildOverride, CheckArgs, CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "isrgate";
const ENV_PREFIX: &str = "ISRGATE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BUILD_DIR: &str = ".next";
const DEFAULT_RENDER_ORIGIN: &str = "http://127.0.0.1:3001";
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REVALIDATION_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub build: BuildSettings,
    pub render: RenderSettings,
    pub cache: CacheSettings,
    pub revalidation: RevalidationSettings,
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

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Directory holding `BUILD_ID` and the manifests.
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub origin: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: StoreBackend,
    pub fs_root: PathBuf,
    pub store_capacity: usize,
    pub tag_mode: TagMode,
}

#[derive(Debug, Clone)]
pub struct RevalidationSettings {
    pub max_concurrency: u32,
    pub queue_limit: usize,
    pub consume_batch_limit: usize,
    /// Zero disables the background consumer.
    pub auto_consume_interval_ms: u64,
    pub request_timeout: Duration,
}

impl Settings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from_settings(&self.cache, &self.revalidation)
    }
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
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Check(args)) => raw.apply_build_override(&args.build),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    build: RawBuildSettings,
    render: RawRenderSettings,
    cache: RawCacheSettings,
    revalidation: RawRevalidationSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(origin) = overrides.render_origin.as_ref() {
            self.render.origin = Some(origin.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(root) = overrides.cache_fs_root.as_ref() {
            self.cache.fs_root = Some(root.clone());
        }
        if let Some(mode) = overrides.cache_tag_mode.as_ref() {
            self.cache.tag_mode = Some(mode.clone());
        }
        if let Some(value) = overrides.revalidation_max_concurrency {
            self.revalidation.max_concurrency = Some(value);
        }
        if let Some(value) = overrides.revalidation_auto_consume_interval_ms {
            self.revalidation.auto_consume_interval_ms = Some(value);
        }

        self.apply_build_override(&overrides.build);
    }

    fn apply_build_override(&mut self, overrides: &BuildOverride) {
        if let Some(dir) = overrides.build_dir.as_ref() {
            self.build.dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            build,
            render,
            cache,
            revalidation,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            build: build_build_settings(build)?,
            render: build_render_settings(render)?,
            cache: build_cache_settings(cache)?,
            revalidation: build_revalidation_settings(revalidation)?,
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

fn build_build_settings(build: RawBuildSettings) -> Result<BuildSettings, LoadError> {
    let dir = build
        .dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR));
    if dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("build.dir", "path must not be empty"));
    }
    Ok(BuildSettings { dir })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let raw_origin = render
        .origin
        .unwrap_or_else(|| DEFAULT_RENDER_ORIGIN.to_string());
    let origin = Url::parse(raw_origin.trim())
        .map_err(|err| LoadError::invalid("render.origin", format!("invalid URL: {err}")))?;
    if !matches!(origin.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "render.origin",
            "scheme must be http or https",
        ));
    }

    let timeout = render.timeout_seconds.unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);
    let timeout = non_zero_u32(timeout, "render.timeout_seconds")?;

    Ok(RenderSettings {
        origin,
        timeout: Duration::from_secs(timeout.get().into()),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let backend = match cache.backend.as_deref().map(str::trim) {
        None => defaults.backend,
        Some(value) if value.eq_ignore_ascii_case("memory") => StoreBackend::Memory,
        Some(value) if value.eq_ignore_ascii_case("fs") => StoreBackend::Fs,
        Some(value) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{value}` (expected memory or fs)"),
            ));
        }
    };

    let tag_mode = match cache.tag_mode.as_deref().map(str::trim) {
        None => defaults.tag_mode,
        Some("original") => TagMode::Original,
        Some("nextMode") | Some("next_mode") => TagMode::NextMode,
        Some(value) => {
            return Err(LoadError::invalid(
                "cache.tag_mode",
                format!("unknown mode `{value}` (expected original or nextMode)"),
            ));
        }
    };

    let fs_root = cache.fs_root.unwrap_or(defaults.fs_root);
    if backend == StoreBackend::Fs && fs_root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.fs_root",
            "path must not be empty when backend is fs",
        ));
    }

    let store_capacity = cache.store_capacity.unwrap_or(defaults.store_capacity);
    if store_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.store_capacity",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        backend,
        fs_root,
        store_capacity,
        tag_mode,
    })
}

fn build_revalidation_settings(
    revalidation: RawRevalidationSettings,
) -> Result<RevalidationSettings, LoadError> {
    let defaults = CacheConfig::default();

    let max_concurrency = non_zero_u32(
        revalidation
            .max_concurrency
            .unwrap_or(defaults.max_revalidate_concurrency)
            .into(),
        "revalidation.max_concurrency",
    )?;

    let queue_limit = revalidation.queue_limit.unwrap_or(defaults.queue_limit);
    if queue_limit == 0 {
        return Err(LoadError::invalid(
            "revalidation.queue_limit",
            "must be greater than zero",
        ));
    }

    let consume_batch_limit = revalidation
        .consume_batch_limit
        .unwrap_or(defaults.consume_batch_limit);
    if consume_batch_limit == 0 {
        return Err(LoadError::invalid(
            "revalidation.consume_batch_limit",
            "must be greater than zero",
        ));
    }

    let request_timeout = non_zero_u32(
        revalidation
            .request_timeout_seconds
            .unwrap_or(DEFAULT_REVALIDATION_TIMEOUT_SECS),
        "revalidation.request_timeout_seconds",
    )?;

    Ok(RevalidationSettings {
        max_concurrency: max_concurrency.get(),
        queue_limit,
        consume_batch_limit,
        auto_consume_interval_ms: revalidation
            .auto_consume_interval_ms
            .unwrap_or(defaults.auto_consume_interval_ms),
        request_timeout: Duration::from_secs(request_timeout.get().into()),
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
struct RawBuildSettings {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    origin: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    fs_root: Option<PathBuf>,
    store_capacity: Option<usize>,
    tag_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRevalidationSettings {
    max_concurrency: Option<u32>,
    queue_limit: Option<usize>,
    consume_batch_limit: Option<usize>,
    auto_consume_interval_ms: Option<u64>,
    request_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
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
    use clap::Parser;

    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
