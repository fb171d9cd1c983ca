//! micro-device-plugin binary
//!
//! Configuration comes from `MICRO_*` environment variables; flags given on
//! the command line take precedence.

use anyhow::Context;
use clap::{ArgAction, Parser};
use micro_device_plugin::runtime::init_tracing;
use micro_device_plugin::supervisor::ExhaustedAction;
use micro_device_plugin::{Config, LogFormat, MicroDevicePlugin, version};
use std::path::PathBuf;

/// Advertise the entries of a directory as Kubernetes micro devices
#[derive(Parser, Debug)]
#[command(name = "micro-device-plugin")]
#[command(version = version::VERSION, long_version = version::long_version(), about)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print version and build information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Directory whose entries are advertised as devices
    #[arg(long, value_name = "DIR")]
    device_dir: Option<PathBuf>,

    /// Kubelet device plugin directory
    #[arg(long, value_name = "DIR")]
    plugin_dir: Option<PathBuf>,

    /// Extended resource name announced to the kubelet
    #[arg(long, value_name = "NAME")]
    resource_name: Option<String>,

    /// Environment variable set in allocated containers
    #[arg(long, value_name = "VAR")]
    device_env: Option<String>,

    /// Restarts tolerated within one crash period
    #[arg(long, value_name = "N")]
    max_restarts: Option<u32>,

    /// What to do once restarts are exhausted (exit or retry)
    #[arg(long, value_name = "ACTION")]
    on_restart_exhausted: Option<ExhaustedAction>,

    /// Do not re-register when the kubelet restarts
    #[arg(long)]
    no_watch_kubelet: bool,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.device_dir {
            config.device_dir = dir;
        }
        if let Some(dir) = self.plugin_dir {
            config.plugin_dir = dir;
        }
        if let Some(name) = self.resource_name {
            config.resource_name = name;
        }
        if let Some(var) = self.device_env {
            config.device_env = var;
        }
        if let Some(n) = self.max_restarts {
            config.restart.max_restarts = n;
        }
        if let Some(action) = self.on_restart_exhausted {
            config.restart.on_exhausted = action;
        }
        if self.no_watch_kubelet {
            config.watch_kubelet = false;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("invalid environment configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_tracing(&config);
    version::log_build_info();

    MicroDevicePlugin::new(config).run().await
}
