//! Error types for the micro device plugin

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for plugin operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// Main error type for the plugin
///
/// Startup failures (scan, bind, registration) propagate to `main` and end
/// the process. Serving failures stay inside the supervisor unless the
/// restart quota runs out.
#[derive(Error, Debug)]
#[allow(clippy::result_large_err)]
pub enum PluginError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The device directory could not be enumerated
    #[error("failed to scan device directory {}: {source}", .path.display())]
    DeviceScan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The advertisement socket could not be bound
    #[error("failed to bind socket {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem watcher error
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// The watcher event stream closed
    #[error("watcher event stream closed")]
    WatchClosed,

    /// gRPC transport error
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC status error
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// Dialing a unix socket did not complete in time
    #[error("timed out after {timeout:?} dialing {}", .path.display())]
    DialTimeout { path: PathBuf, timeout: Duration },

    /// The gRPC server crashed more often than the restart policy allows
    #[error("server crashed {restarts} times within the crash period, giving up")]
    RestartQuotaExhausted { restarts: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// gRPC status for callers embedding the plugin behind their own services
///
/// The device plugin RPCs themselves are infallible.
impl From<PluginError> for tonic::Status {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Config(msg) => tonic::Status::invalid_argument(msg),
            PluginError::Transport(e) => tonic::Status::unavailable(e.to_string()),
            PluginError::Grpc(status) => status,
            PluginError::DialTimeout { .. } => tonic::Status::deadline_exceeded(err.to_string()),
            PluginError::RestartQuotaExhausted { .. } | PluginError::WatchClosed => {
                tonic::Status::unavailable(err.to_string())
            }
            PluginError::DeviceScan { .. }
            | PluginError::Bind { .. }
            | PluginError::Watch(_)
            | PluginError::Io(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
