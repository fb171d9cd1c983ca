//! Micro Device Plugin
//!
//! Advertises the entries of a local directory as schedulable "micro devices"
//! to the kubelet through the device plugin API (`v1beta1`).
//!
//! # Architecture
//!
//! ```text
//! device dir ──► DeviceWatcher ──► DeviceRegistry ──► MicroDeviceService ──► kubelet
//!                                        │                   ▲
//!                                  change signal      ServerSupervisor
//!                                                            │
//!                                     Registrar ──► kubelet.sock (Register)
//! ```
//!
//! The watcher is the only writer of the registry. Every open `ListAndWatch`
//! stream re-reads the registry when the change signal fires. The supervisor
//! owns the advertisement socket and restarts the gRPC server on failure.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod device;
pub mod error;
pub mod kubelet;
pub mod registration;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod supervisor;
pub mod version;
pub mod watcher;

// Proto types generated from deviceplugin/v1beta1/api.proto
pub mod proto {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::derive_partial_eq_without_eq)]

    include!("proto/v1beta1.rs");

    pub use device_plugin_server::DevicePlugin;
    pub use device_plugin_server::DevicePluginServer;
    pub use registration_client::RegistrationClient;
}

pub use config::{Config, LogFormat};
pub use device::{DeviceId, DeviceRecord, Health};
pub use error::{PluginError, Result};
pub use kubelet::KubeletWatcher;
pub use registration::{API_VERSION, Registrar, dial};
pub use registry::DeviceRegistry;
pub use runtime::MicroDevicePlugin;
pub use service::MicroDeviceService;
pub use supervisor::{CrashVerdict, ExhaustedAction, RestartPolicy, RestartTracker, ServerSupervisor};
pub use watcher::DeviceWatcher;
