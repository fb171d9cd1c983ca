//! Configuration for the micro device plugin
//!
//! Loaded from `MICRO_*` environment variables, then overridden by CLI flags
//! in `main`. Every field has a default matching a stock kubelet layout.

use crate::error::{PluginError, Result};
use crate::supervisor::{ExhaustedAction, RestartPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DEVICE_DIR: &str = "/etc/micro";
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
pub const DEFAULT_PLUGIN_SOCKET: &str = "micro.sock";
pub const DEFAULT_KUBELET_SOCKET: &str = "kubelet.sock";
pub const DEFAULT_RESOURCE_NAME: &str = "micro.plugin";
pub const DEFAULT_DEVICE_ENV: &str = "MICRO_DEVICES";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(PluginError::Config(format!(
                "unknown log format '{other}', expected 'pretty' or 'json'"
            ))),
        }
    }
}

/// Plugin configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory whose non-directory entries are advertised as devices
    pub device_dir: PathBuf,
    /// Kubelet device plugin directory holding both sockets
    pub plugin_dir: PathBuf,
    /// File name of our advertisement socket inside `plugin_dir`
    pub plugin_socket: String,
    /// File name of the kubelet registration socket inside `plugin_dir`
    pub kubelet_socket: String,
    /// Extended resource name announced to the kubelet
    pub resource_name: String,
    /// Environment variable injected into allocated containers
    pub device_env: String,
    /// Bound on every unix socket dial
    pub dial_timeout: Duration,
    /// Crash-loop policy of the gRPC server
    pub restart: RestartPolicy,
    /// Re-register when the kubelet socket is re-created
    pub watch_kubelet: bool,
    /// Pause between a kubelet restart and re-registration
    pub reregister_delay: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            plugin_socket: DEFAULT_PLUGIN_SOCKET.to_string(),
            kubelet_socket: DEFAULT_KUBELET_SOCKET.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            device_env: DEFAULT_DEVICE_ENV.to_string(),
            dial_timeout: Duration::from_secs(5),
            restart: RestartPolicy::default(),
            watch_kubelet: true,
            reregister_delay: Duration::from_secs(1),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Missing keys fall back to defaults; present but unparseable values are
    /// configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let restart_defaults = &defaults.restart;

        let config = Self {
            device_dir: lookup("MICRO_DEVICE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.device_dir),
            plugin_dir: lookup("MICRO_PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            plugin_socket: lookup("MICRO_PLUGIN_SOCKET").unwrap_or(defaults.plugin_socket),
            kubelet_socket: lookup("MICRO_KUBELET_SOCKET").unwrap_or(defaults.kubelet_socket),
            resource_name: lookup("MICRO_RESOURCE_NAME").unwrap_or(defaults.resource_name),
            device_env: lookup("MICRO_DEVICE_ENV").unwrap_or(defaults.device_env),
            dial_timeout: parse_or(&lookup, "MICRO_DIAL_TIMEOUT_SECS", defaults.dial_timeout.as_secs())
                .map(Duration::from_secs)?,
            restart: RestartPolicy {
                max_restarts: parse_or(&lookup, "MICRO_MAX_RESTARTS", restart_defaults.max_restarts)?,
                crash_period: parse_or(
                    &lookup,
                    "MICRO_CRASH_PERIOD_SECS",
                    restart_defaults.crash_period.as_secs(),
                )
                .map(Duration::from_secs)?,
                restart_delay: parse_or(
                    &lookup,
                    "MICRO_RESTART_DELAY_MS",
                    restart_defaults.restart_delay.as_millis() as u64,
                )
                .map(Duration::from_millis)?,
                on_exhausted: parse_or(
                    &lookup,
                    "MICRO_ON_RESTART_EXHAUSTED",
                    restart_defaults.on_exhausted,
                )?,
            },
            watch_kubelet: parse_or(&lookup, "MICRO_WATCH_KUBELET", defaults.watch_kubelet)?,
            reregister_delay: parse_or(
                &lookup,
                "MICRO_REREGISTER_DELAY_MS",
                defaults.reregister_delay.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
            log_level: lookup("MICRO_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or(&lookup, "MICRO_LOG_FORMAT", defaults.log_format)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the plugin cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.trim().is_empty() {
            return Err(PluginError::Config("resource name is required".to_string()));
        }
        if self.device_env.trim().is_empty() {
            return Err(PluginError::Config(
                "device environment variable name is required".to_string(),
            ));
        }
        for (what, name) in [
            ("plugin socket", &self.plugin_socket),
            ("kubelet socket", &self.kubelet_socket),
        ] {
            if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
                return Err(PluginError::Config(format!(
                    "{what} must be a bare file name, got '{name}'"
                )));
            }
        }
        if self.plugin_socket == self.kubelet_socket {
            return Err(PluginError::Config(
                "plugin socket and kubelet socket must differ".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(PluginError::Config("dial timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Full path of the advertisement socket
    pub fn plugin_socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.plugin_socket)
    }

    /// Full path of the kubelet registration socket
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.kubelet_socket)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PluginError::Config(format!("invalid {key}='{raw}': {e}"))),
        None => Ok(default),
    }
}
