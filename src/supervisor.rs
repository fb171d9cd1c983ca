//! Server supervisor
//!
//! Owns the advertisement socket and keeps the `DevicePlugin` gRPC server
//! running on it. A serve attempt that ends with an error is restarted under a
//! [`RestartPolicy`]; one that ends cleanly (shutdown) ends the loop.
//!
//! ```text
//! bind ──► serve ──► Ok ──► exit
//!            ▲  │
//!            │  └─► Err ──► RestartTracker ──► Restart (after delay)
//!            │                     │
//!            └─────────────────────┘  └─► Exhausted ──► Exit | keep retrying
//! ```

use crate::error::{PluginError, Result};
use crate::proto::DevicePluginServer;
use crate::service::MicroDeviceService;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

/// What to do once the server crashed more often than allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedAction {
    /// Stop supervising and report [`PluginError::RestartQuotaExhausted`]
    #[default]
    Exit,
    /// Log at error level and keep restarting
    Retry,
}

impl FromStr for ExhaustedAction {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exit" | "terminate" => Ok(ExhaustedAction::Exit),
            "retry" | "keep-retrying" => Ok(ExhaustedAction::Retry),
            other => Err(PluginError::Config(format!(
                "unknown restart exhaustion action '{other}', expected 'exit' or 'retry'"
            ))),
        }
    }
}

/// Crash-loop policy for the gRPC server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive restarts tolerated inside one crash period
    pub max_restarts: u32,
    /// Uptime after which a crash no longer counts as part of a crash loop
    pub crash_period: Duration,
    /// Pause before each restart
    pub restart_delay: Duration,
    pub on_exhausted: ExhaustedAction,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            crash_period: Duration::from_secs(3600),
            restart_delay: Duration::from_secs(1),
            on_exhausted: ExhaustedAction::Exit,
        }
    }
}

/// Outcome of recording one crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// Restart; `restarts` is the updated consecutive-restart count
    Restart { restarts: u32 },
    /// The count was already above `max_restarts` when this crash happened
    Exhausted { restarts: u32 },
}

/// Consecutive-restart bookkeeping
///
/// A crash after more than `crash_period` of uptime means the server had
/// stabilised: the count resets to 1. Any other crash is first checked
/// against `max_restarts` and then counted.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempt_started: Instant,
    restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy, now: Instant) -> Self {
        Self {
            policy,
            attempt_started: now,
            restarts: 0,
        }
    }

    /// Mark the start of a serve attempt
    pub fn attempt_started(&mut self, now: Instant) {
        self.attempt_started = now;
    }

    /// Record a crash of the current attempt
    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        let uptime = now.saturating_duration_since(self.attempt_started);
        if uptime > self.policy.crash_period {
            self.restarts = 1;
            return CrashVerdict::Restart { restarts: 1 };
        }

        let exhausted = self.restarts > self.policy.max_restarts;
        self.restarts = self.restarts.saturating_add(1);
        if exhausted {
            CrashVerdict::Exhausted {
                restarts: self.restarts,
            }
        } else {
            CrashVerdict::Restart {
                restarts: self.restarts,
            }
        }
    }

    #[cfg(test)]
    fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// Binds the advertisement socket and supervises the gRPC server on it
pub struct ServerSupervisor {
    socket_path: PathBuf,
    policy: RestartPolicy,
    service: MicroDeviceService,
}

impl ServerSupervisor {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        policy: RestartPolicy,
        service: MicroDeviceService,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            policy,
            service,
        }
    }

    /// Bind the advertisement socket, replacing a stale socket file
    ///
    /// Called once per session; failure is fatal to the caller.
    pub fn bind(&self) -> Result<UnixListener> {
        remove_stale_socket(&self.socket_path).map_err(|source| PluginError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| PluginError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        info!(socket = %self.socket_path.display(), "advertisement socket bound");
        Ok(listener)
    }

    /// Serve on `listener` until `cancel` fires, restarting on failure
    ///
    /// Returns `Ok` after a graceful shutdown and
    /// [`PluginError::RestartQuotaExhausted`] when the policy gives up.
    pub async fn run(self, listener: UnixListener, cancel: CancellationToken) -> Result<()> {
        let listener = Arc::new(listener);
        let resource = self.service.resource_name().to_string();
        let service = self.service;

        let result = supervise(&self.policy, &cancel, || {
            let incoming = incoming(Arc::clone(&listener));
            let server = DevicePluginServer::new(service.clone());
            let shutdown = cancel.clone();
            info!(resource = %resource, "starting RPC server");
            async move {
                Server::builder()
                    .add_service(server)
                    .serve_with_incoming_shutdown(incoming, async move {
                        shutdown.cancelled().await;
                    })
                    .await
            }
        })
        .await;

        if let Err(e) = remove_stale_socket(&self.socket_path) {
            warn!(socket = %self.socket_path.display(), error = %e, "failed to remove socket");
        }
        result
    }
}

/// Restart loop shared by the real server and tests
pub(crate) async fn supervise<F, Fut, E>(
    policy: &RestartPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    let mut tracker = RestartTracker::new(policy.clone(), Instant::now());

    loop {
        tracker.attempt_started(Instant::now());
        let err = match attempt().await {
            Ok(()) => {
                info!("RPC server stopped");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(error = %err, "RPC server crashed");

        match tracker.record_crash(Instant::now()) {
            CrashVerdict::Restart { restarts } => {
                debug!(restarts, "restarting RPC server");
            }
            CrashVerdict::Exhausted { restarts } => {
                error!(
                    restarts,
                    max_restarts = policy.max_restarts,
                    "micro device plugin has repeatedly crashed recently"
                );
                if policy.on_exhausted == ExhaustedAction::Exit {
                    return Err(PluginError::RestartQuotaExhausted { restarts });
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.restart_delay) => {}
            _ = cancel.cancelled() => {
                info!("supervisor cancelled during restart delay");
                return Ok(());
            }
        }
    }
}

/// Accept loop over a listener that outlives individual serve attempts
fn incoming(listener: Arc<UnixListener>) -> impl Stream<Item = io::Result<UnixStream>> {
    async_stream::stream! {
        loop {
            yield listener.accept().await.map(|(stream, _)| stream);
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
