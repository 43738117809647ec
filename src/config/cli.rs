use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the isrgate binary.
#[derive(Debug, Parser)]
#[command(
    name = "isrgate",
    version,
    about = "Routing and incremental cache gateway for prerendered sites"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ISRGATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve requests in front of the render origin.
    Serve(Box<ServeArgs>),
    /// Load and validate the build manifests, then print a summary.
    Check(CheckArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct BuildOverride {
    /// Override the build output directory holding the manifests.
    #[arg(long = "build-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub build_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub build: BuildOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub build: BuildOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Override the render origin that handles cache misses.
    #[arg(long = "render-origin", value_name = "URL")]
    pub render_origin: Option<String>,

    /// Override the artifact store backend (memory|fs).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the fs backend root directory.
    #[arg(long = "cache-fs-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_fs_root: Option<PathBuf>,

    /// Override the tag invalidation mode (original|nextMode).
    #[arg(long = "cache-tag-mode", value_name = "MODE")]
    pub cache_tag_mode: Option<String>,

    /// Override the number of revalidation partitions.
    #[arg(long = "revalidation-max-concurrency", value_name = "COUNT")]
    pub revalidation_max_concurrency: Option<u32>,

    /// Override the revalidation consumer interval in milliseconds.
    #[arg(long = "revalidation-auto-consume-interval-ms", value_name = "MS")]
    pub revalidation_auto_consume_interval_ms: Option<u64>,
}
