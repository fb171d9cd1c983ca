//! Kubelet restart detection
//!
//! A restarting kubelet wipes the device plugin directory and re-creates its
//! registration socket. Plugins registered with the old kubelet are forgotten,
//! so the runtime waits here for that socket to appear and then starts a new
//! session.

use crate::error::{PluginError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Watches the plugin directory for a re-created kubelet socket
pub struct KubeletWatcher {
    socket_name: OsString,
    plugin_dir: PathBuf,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl KubeletWatcher {
    pub fn new(plugin_dir: impl Into<PathBuf>, kubelet_socket: &str) -> Result<Self> {
        let plugin_dir = plugin_dir.into();
        let (tx, events) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&plugin_dir, RecursiveMode::NonRecursive)?;

        info!(dir = %plugin_dir.display(), socket = kubelet_socket, "watching for kubelet restarts");
        Ok(Self {
            socket_name: OsString::from(kubelet_socket),
            plugin_dir,
            events,
            _watcher: watcher,
        })
    }

    /// Resolve once the kubelet socket has been created again
    pub async fn wait_for_restart(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Some(Ok(event)) if self.is_socket_created(&event) => {
                    info!("kubelet socket re-created, kubelet restarted");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => error!(error = %e, "kubelet watch error"),
                None => return Err(PluginError::WatchClosed),
            }
        }
    }

    fn is_socket_created(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|p| self.is_kubelet_socket(p))
    }

    fn is_kubelet_socket(&self, path: &Path) -> bool {
        path.parent() == Some(self.plugin_dir.as_path())
            && path.file_name() == Some(self.socket_name.as_os_str())
    }
}
