//! Kubelet registration client
//!
//! Dials a unix socket with a bounded timeout and announces the plugin to the
//! kubelet's `Registration` service.

use crate::config::Config;
use crate::error::{PluginError, Result};
use crate::proto::{DevicePluginOptions, RegisterRequest, RegistrationClient};
use crate::service::MicroDeviceService;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info};

/// Device plugin API version spoken by this plugin
pub const API_VERSION: &str = "v1beta1";

/// Placeholder authority; the connector ignores it and dials the socket path
const UNIX_AUTHORITY: &str = "http://[::]:50051";

/// Open a gRPC channel over the unix socket at `path`
///
/// Fails with [`PluginError::DialTimeout`] if the connection is not up within
/// `timeout`.
pub async fn dial(path: &Path, timeout: Duration) -> Result<Channel> {
    let socket = path.to_path_buf();
    let connector = tower::service_fn(move |_: Uri| UnixStream::connect(socket.clone()));

    let endpoint = Endpoint::from_static(UNIX_AUTHORITY)
        .connect_timeout(timeout)
        .timeout(timeout);

    let channel = tokio::time::timeout(timeout, endpoint.connect_with_connector(connector))
        .await
        .map_err(|_| PluginError::DialTimeout {
            path: path.to_path_buf(),
            timeout,
        })??;

    debug!(socket = %path.display(), "unix socket connected");
    Ok(channel)
}

/// Announces the plugin endpoint to the kubelet
#[derive(Debug, Clone)]
pub struct Registrar {
    kubelet_socket: PathBuf,
    endpoint: String,
    resource_name: String,
    options: DevicePluginOptions,
    dial_timeout: Duration,
}

impl Registrar {
    pub fn new(
        kubelet_socket: impl Into<PathBuf>,
        endpoint: impl Into<String>,
        resource_name: impl Into<String>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            kubelet_socket: kubelet_socket.into(),
            endpoint: endpoint.into(),
            resource_name: resource_name.into(),
            options: MicroDeviceService::options(),
            dial_timeout,
        }
    }

    /// Registrar for the sockets and resource named in `config`
    ///
    /// The endpoint is the advertisement socket's file name, relative to the
    /// kubelet's device plugin directory.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.kubelet_socket_path(),
            config.plugin_socket.clone(),
            config.resource_name.clone(),
            config.dial_timeout,
        )
    }

    /// The request sent to the kubelet
    pub fn request(&self) -> RegisterRequest {
        RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options.clone()),
        }
    }

    /// Dial the kubelet and register once
    pub async fn register(&self) -> Result<()> {
        let channel = dial(&self.kubelet_socket, self.dial_timeout).await?;
        let mut client = RegistrationClient::new(channel);

        client.register(self.request()).await?;

        info!(
            resource = %self.resource_name,
            endpoint = %self.endpoint,
            version = API_VERSION,
            "registered with kubelet"
        );
        Ok(())
    }
}
