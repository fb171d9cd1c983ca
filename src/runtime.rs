//! Plugin runtime
//!
//! Wires the watcher, registry, gRPC server and registration together and
//! runs them until shutdown.
//!
//! ```text
//! start ──► watch + scan device dir
//!             │
//!             ▼
//!        ┌─ session ──────────────────────────────┐
//!        │ bind socket ─► serve ─► check ─► register │
//!        └────────────────────────────────────────┘
//!             │ kubelet restarted: cancel session, wait, new session
//!             │ shutdown signal:   cancel everything, exit 0
//!             │ server gave up:    exit 1
//! ```

use crate::config::{Config, LogFormat};
use crate::error::Result;
use crate::kubelet::KubeletWatcher;
use crate::registration::{Registrar, dial};
use crate::registry::DeviceRegistry;
use crate::service::MicroDeviceService;
use crate::supervisor::ServerSupervisor;
use crate::watcher::DeviceWatcher;
use anyhow::Context;
use std::future::Future;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The micro device plugin process
pub struct MicroDevicePlugin {
    config: Config,
    registry: DeviceRegistry,
}

/// One bind/serve/register cycle
struct Session {
    cancel: CancellationToken,
    server: JoinHandle<Result<()>>,
}

impl Session {
    /// Cancel the session and wait for its server to stop
    async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.server.await.context("RPC server task failed")??;
        Ok(())
    }
}

/// Why the session loop ended
enum Exit {
    Shutdown,
    ServerStopped(anyhow::Result<()>),
    WatcherStopped(anyhow::Result<()>),
}

impl MicroDevicePlugin {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
        }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or a fatal error occurs
    pub async fn run_until<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let config = &self.config;
        info!(
            device_dir = %config.device_dir.display(),
            socket = %config.plugin_socket_path().display(),
            resource = %config.resource_name,
            "starting micro device plugin"
        );

        let root = CancellationToken::new();

        let watcher = DeviceWatcher::start(&config.device_dir, self.registry.clone())
            .with_context(|| format!("failed to watch {}", config.device_dir.display()))?;
        let mut watcher_task = tokio::spawn(watcher.run(root.child_token()));

        let mut kubelet = if config.watch_kubelet {
            Some(
                KubeletWatcher::new(&config.plugin_dir, &config.kubelet_socket)
                    .with_context(|| format!("failed to watch {}", config.plugin_dir.display()))?,
            )
        } else {
            None
        };

        tokio::pin!(shutdown);

        let exit = loop {
            let mut session = match self.start_session(&root).await {
                Ok(session) => session,
                Err(e) => {
                    root.cancel();
                    let _ = watcher_task.await;
                    return Err(e);
                }
            };

            let restarted = async {
                match kubelet.as_mut() {
                    Some(kubelet) => kubelet.wait_for_restart().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    if let Err(e) = session.stop().await {
                        warn!(error = %e, "RPC server stopped with error during shutdown");
                    }
                    break Exit::Shutdown;
                }
                result = &mut session.server => {
                    let result = result
                        .context("RPC server task failed")
                        .and_then(|r| r.map_err(anyhow::Error::from));
                    break Exit::ServerStopped(result);
                }
                result = &mut watcher_task => {
                    session.cancel.cancel();
                    let _ = session.server.await;
                    let result = result
                        .context("device watcher task failed")
                        .and_then(|r| r.map_err(anyhow::Error::from));
                    break Exit::WatcherStopped(result);
                }
                result = restarted => {
                    if let Err(e) = result {
                        session.cancel.cancel();
                        let _ = session.server.await;
                        break Exit::WatcherStopped(Err(e.into()));
                    }
                    warn!("kubelet restarted, re-registering");
                    if let Err(e) = session.stop().await {
                        warn!(error = %e, "RPC server stopped with error");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.reregister_delay) => {}
                        _ = &mut shutdown => {
                            info!("shutdown requested while waiting to re-register");
                            break Exit::Shutdown;
                        }
                    }
                }
            }
        };

        root.cancel();
        let result = match exit {
            Exit::Shutdown => {
                let _ = watcher_task.await;
                Ok(())
            }
            Exit::ServerStopped(result) => {
                let _ = watcher_task.await;
                match result {
                    Ok(()) => Err(anyhow::anyhow!("RPC server stopped unexpectedly")),
                    Err(e) => Err(e),
                }
            }
            Exit::WatcherStopped(Ok(())) => Err(anyhow::anyhow!("device watcher stopped unexpectedly")),
            Exit::WatcherStopped(Err(e)) => Err(e),
        };

        match &result {
            Ok(()) => info!("micro device plugin stopped"),
            Err(e) => error!(error = %e, "micro device plugin failed"),
        }
        result
    }

    /// Bind, serve, check readiness and register under a fresh child token
    async fn start_session(&self, root: &CancellationToken) -> anyhow::Result<Session> {
        let config = &self.config;
        let cancel = root.child_token();

        let service = MicroDeviceService::new(
            self.registry.clone(),
            config.resource_name.as_str(),
            config.device_env.as_str(),
            cancel.clone(),
        );
        let supervisor =
            ServerSupervisor::new(config.plugin_socket_path(), config.restart.clone(), service);
        let listener = supervisor.bind()?;
        let session = Session {
            server: tokio::spawn(supervisor.run(listener, cancel.clone())),
            cancel,
        };

        if let Err(e) = self.announce().await {
            let _ = session.stop().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Confirm our socket answers, then register with the kubelet
    async fn announce(&self) -> anyhow::Result<()> {
        let config = &self.config;
        let socket = config.plugin_socket_path();

        let ready = dial(&socket, config.dial_timeout)
            .await
            .context("RPC server did not come up")?;
        drop(ready);
        info!(socket = %socket.display(), "RPC server ready");

        Registrar::from_config(config)
            .register()
            .await
            .context("failed to register with kubelet")
    }
}

/// Filter used when `RUST_LOG` is unset: this crate at `level`, the rest at `warn`
///
/// A level that already holds directives (`,` or `=`) is used verbatim.
fn default_filter(level: &str) -> String {
    if level.contains(',') || level.contains('=') {
        level.to_string()
    } else {
        format!("warn,{}={level}", env!("CARGO_CRATE_NAME"))
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `log_level`.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(&config.log_level).into());
    let subscriber = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Pretty => subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!(error = %e, "cannot listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let received = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };
    info!(signal = received, "stopping micro device plugin");
}
