//! `DevicePlugin` gRPC service
//!
//! Answers the kubelet's device plugin RPCs from the [`DeviceRegistry`].
//! `ListAndWatch` streams one full snapshot on connect and another after every
//! registry change until the client goes away or the session is cancelled.

use crate::device::DeviceRecord;
use crate::proto::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePlugin,
    DevicePluginOptions, Empty, ListAndWatchResponse, PreStartContainerRequest,
    PreStartContainerResponse, PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::registry::DeviceRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Snapshots buffered per stream before the sender waits on the client
const STREAM_BUFFER: usize = 4;

/// Device plugin service backed by the shared registry
#[derive(Clone)]
pub struct MicroDeviceService {
    registry: DeviceRegistry,
    resource_name: Arc<str>,
    device_env: Arc<str>,
    cancel: CancellationToken,
}

impl MicroDeviceService {
    /// `cancel` ends every open `ListAndWatch` stream when the session stops
    pub fn new(
        registry: DeviceRegistry,
        resource_name: impl Into<Arc<str>>,
        device_env: impl Into<Arc<str>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            resource_name: resource_name.into(),
            device_env: device_env.into(),
            cancel,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Capabilities advertised at registration and by `GetDevicePluginOptions`
    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: true,
            get_preferred_allocation_available: false,
        }
    }

    fn list_response(registry: &DeviceRegistry) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: wire_devices(&registry.snapshot()),
        }
    }

    /// Environment handed to one container for its allocated device IDs
    fn container_response(&self, device_ids: &[String]) -> ContainerAllocateResponse {
        let mut envs = HashMap::with_capacity(1);
        envs.insert(self.device_env.to_string(), device_ids.join(","));
        ContainerAllocateResponse {
            envs,
            ..Default::default()
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for MicroDeviceService {
    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(Self::options()))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        let req = request.into_inner();
        debug!(devices = ?req.devices_ids, "pre-start container");
        Ok(Response::new(PreStartContainerResponse {}))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let req = request.into_inner();
        debug!(
            containers = req.container_requests.len(),
            "preferred allocation requested; no preference"
        );
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let req = request.into_inner();
        let container_responses = req
            .container_requests
            .iter()
            .map(|container| {
                info!(
                    resource = %self.resource_name,
                    devices = ?container.devices_ids,
                    "allocating devices"
                );
                self.container_response(&container.devices_ids)
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();

        // Subscribe before the first snapshot so no change falls in between
        let mut updates = registry.subscribe();
        info!(devices = registry.len(), "ListAndWatch stream opened");

        tokio::spawn(async move {
            loop {
                let generation = *updates.borrow_and_update();
                let response = Self::list_response(&registry);
                let count = response.devices.len();

                tokio::select! {
                    sent = tx.send(Ok(response)) => {
                        if sent.is_err() {
                            info!("ListAndWatch client disconnected");
                            return;
                        }
                        debug!(devices = count, generation, "sent device list");
                    }
                    _ = cancel.cancelled() => break,
                }

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            warn!("device registry dropped, closing ListAndWatch stream");
                            return;
                        }
                    }
                    _ = tx.closed() => {
                        info!("ListAndWatch client disconnected");
                        return;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("ListAndWatch stream closed by shutdown");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Records as wire devices, in registry order
pub fn wire_devices(records: &[DeviceRecord]) -> Vec<Device> {
    records.iter().map(Device::from).collect()
}
