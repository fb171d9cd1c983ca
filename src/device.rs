//! Device records
//!
//! A micro device is a non-directory entry of the device directory. Only the
//! entry name matters: it is the registry key and the input to the device ID.

use crate::proto;
use sha2::{Digest, Sha256};
use std::fmt;

/// Health value reported for a usable device
pub const HEALTHY: &str = "Healthy";
/// Health value reported for a device the kubelet must not allocate
pub const UNHEALTHY: &str = "Unhealthy";

/// Stable identifier of a device
///
/// Derived from the entry name with SHA-256 and rendered as 64 lowercase hex
/// characters, so the same name always yields the same ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Derive the ID for a device directory entry name
    pub fn from_name(name: &str) -> Self {
        Self(hex::encode(Sha256::digest(name.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device health as understood by the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => HEALTHY,
            Health::Unhealthy => UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Entry name in the device directory (registry key)
    pub name: String,
    pub id: DeviceId,
    pub health: Health,
}

impl DeviceRecord {
    /// A healthy record for a freshly discovered entry
    pub fn healthy(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = DeviceId::from_name(&name);
        Self {
            name,
            id,
            health: Health::Healthy,
        }
    }
}

impl From<&DeviceRecord> for proto::Device {
    fn from(record: &DeviceRecord) -> Self {
        proto::Device {
            id: record.id.to_string(),
            health: record.health.as_str().to_string(),
            topology: None,
        }
    }
}
