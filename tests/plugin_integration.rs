//! Plugin Integration Tests
//!
//! Runs the whole plugin against a fake kubelet on temporary unix sockets and
//! drives it through the real device plugin client.

use micro_device_plugin::proto::device_plugin_client::DevicePluginClient;
use micro_device_plugin::proto::registration_server::{Registration, RegistrationServer};
use micro_device_plugin::proto::{
    AllocateRequest, ContainerAllocateRequest, Empty, ListAndWatchResponse, RegisterRequest,
};
use micro_device_plugin::{Config, DeviceId, MicroDevicePlugin, dial};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status, Streaming};

const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// TEST INFRASTRUCTURE
// =============================================================================

/// Kubelet registration service that forwards every request to the test
struct FakeKubelet {
    requests: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        let _ = self.requests.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

struct KubeletHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl KubeletHandle {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

fn start_kubelet(socket: &Path, requests: mpsc::UnboundedSender<RegisterRequest>) -> KubeletHandle {
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket).unwrap();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(FakeKubelet { requests }))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown_rx.await.ok();
            })
            .await
            .ok();
    });

    KubeletHandle { shutdown, task }
}

struct PluginHandle {
    socket: PathBuf,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl PluginHandle {
    async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(TIMEOUT, self.task).await.unwrap().unwrap()
    }
}

fn start_plugin(config: Config) -> PluginHandle {
    let socket = config.plugin_socket_path();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(MicroDevicePlugin::new(config).run_until(async move {
        shutdown_rx.await.ok();
    }));
    PluginHandle {
        socket,
        shutdown,
        task,
    }
}

fn test_config(device_dir: &Path, plugin_dir: &Path) -> Config {
    Config {
        device_dir: device_dir.to_path_buf(),
        plugin_dir: plugin_dir.to_path_buf(),
        resource_name: "example.com/micro".to_string(),
        dial_timeout: Duration::from_secs(2),
        reregister_delay: Duration::from_millis(100),
        ..Config::default()
    }
}

async fn next_registration(rx: &mut mpsc::UnboundedReceiver<RegisterRequest>) -> RegisterRequest {
    tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

async fn connect(socket: &Path) -> DevicePluginClient<tonic::transport::Channel> {
    DevicePluginClient::new(dial(socket, Duration::from_secs(2)).await.unwrap())
}

fn ids(response: &ListAndWatchResponse) -> Vec<String> {
    response.devices.iter().map(|d| d.id.clone()).collect()
}

fn id(name: &str) -> String {
    DeviceId::from_name(name).to_string()
}

/// Read snapshots until one matches `expected`
async fn wait_for_ids(stream: &mut Streaming<ListAndWatchResponse>, expected: Vec<String>) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let response = stream.next().await.unwrap().unwrap();
            if ids(&response) == expected {
                return;
            }
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// LIFECYCLE TESTS
// =============================================================================

#[tokio::test]
async fn test_register_list_and_watch_and_shutdown() {
    let devices = tempfile::tempdir().unwrap();
    let plugins = tempfile::tempdir().unwrap();
    std::fs::write(devices.path().join("a"), b"").unwrap();
    std::fs::write(devices.path().join("b"), b"").unwrap();

    let (tx, mut registrations) = mpsc::unbounded_channel();
    let kubelet = start_kubelet(&plugins.path().join("kubelet.sock"), tx);
    let plugin = start_plugin(test_config(devices.path(), plugins.path()));

    let request = next_registration(&mut registrations).await;
    assert_eq!(request.version, "v1beta1");
    assert_eq!(request.endpoint, "micro.sock");
    assert_eq!(request.resource_name, "example.com/micro");
    assert!(request.options.unwrap().pre_start_required);

    let mut client = connect(&plugin.socket).await;
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();

    let first = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ids(&first), vec![id("a"), id("b")]);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    std::fs::remove_file(devices.path().join("a")).unwrap();
    wait_for_ids(&mut stream, vec![id("b")]).await;

    std::fs::write(devices.path().join("c"), b"").unwrap();
    wait_for_ids(&mut stream, vec![id("b"), id("c")]).await;

    let socket = plugin.socket.clone();
    plugin.stop().await.unwrap();
    assert!(!socket.exists());

    kubelet.stop().await;
}

#[tokio::test]
async fn test_allocate_over_socket() {
    let devices = tempfile::tempdir().unwrap();
    let plugins = tempfile::tempdir().unwrap();
    std::fs::write(devices.path().join("tty0"), b"").unwrap();

    let (tx, mut registrations) = mpsc::unbounded_channel();
    let kubelet = start_kubelet(&plugins.path().join("kubelet.sock"), tx);
    let plugin = start_plugin(test_config(devices.path(), plugins.path()));
    next_registration(&mut registrations).await;

    let mut client = connect(&plugin.socket).await;

    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .unwrap()
        .into_inner();
    assert!(options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec![id("tty0"), "other".to_string()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    let expected = format!("{},other", id("tty0"));
    assert_eq!(
        response.container_responses[0].envs.get("MICRO_DEVICES"),
        Some(&expected)
    );

    plugin.stop().await.unwrap();
    kubelet.stop().await;
}

#[tokio::test]
async fn test_reregisters_after_kubelet_restart() {
    let devices = tempfile::tempdir().unwrap();
    let plugins = tempfile::tempdir().unwrap();
    let kubelet_socket = plugins.path().join("kubelet.sock");

    let (tx, mut registrations) = mpsc::unbounded_channel();
    let kubelet = start_kubelet(&kubelet_socket, tx.clone());
    let plugin = start_plugin(test_config(devices.path(), plugins.path()));
    next_registration(&mut registrations).await;

    kubelet.stop().await;
    let kubelet = start_kubelet(&kubelet_socket, tx);

    let again = next_registration(&mut registrations).await;
    assert_eq!(again.endpoint, "micro.sock");

    // The new session serves on a fresh socket
    let mut client = connect(&plugin.socket).await;
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    wait_for_ids(&mut stream, vec![]).await;

    plugin.stop().await.unwrap();
    kubelet.stop().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_reregistration_delay() {
    let devices = tempfile::tempdir().unwrap();
    let plugins = tempfile::tempdir().unwrap();
    let kubelet_socket = plugins.path().join("kubelet.sock");

    let (tx, mut registrations) = mpsc::unbounded_channel();
    let kubelet = start_kubelet(&kubelet_socket, tx.clone());
    let mut config = test_config(devices.path(), plugins.path());
    config.reregister_delay = Duration::from_secs(3600);
    let plugin = start_plugin(config);
    next_registration(&mut registrations).await;

    kubelet.stop().await;
    let kubelet = start_kubelet(&kubelet_socket, tx);

    // The old session is torn down before the delay starts
    tokio::time::timeout(TIMEOUT, async {
        while plugin.socket.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    plugin.stop().await.unwrap();
    assert!(registrations.try_recv().is_err());
    kubelet.stop().await;
}

#[tokio::test]
async fn test_missing_kubelet_is_fatal() {
    let devices = tempfile::tempdir().unwrap();
    let plugins = tempfile::tempdir().unwrap();
    let mut config = test_config(devices.path(), plugins.path());
    config.dial_timeout = Duration::from_millis(500);

    let plugin = start_plugin(config);
    let result = tokio::time::timeout(TIMEOUT, plugin.task).await.unwrap().unwrap();
    assert!(result.is_err());
}
