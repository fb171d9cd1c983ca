//! Device registry
//!
//! In-memory table of the devices currently present in the device directory,
//! keyed by entry name. The watcher is the only writer; every `ListAndWatch`
//! stream reads it through [`DeviceRegistry::snapshot`].
//!
//! Writers announce changes with [`DeviceRegistry::publish`]. The signal is a
//! generation counter on a `watch` channel, so publishing never blocks, bursts
//! coalesce, and every subscriber sees the latest generation.

use crate::device::DeviceRecord;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Shared handle to the device table
///
/// Cloning is cheap; all clones see the same devices and the same change
/// signal.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    /// Devices by entry name
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
    /// Change generation, bumped on every publish
    changes: watch::Sender<u64>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    /// Insert or replace the record stored under its entry name
    ///
    /// Returns `true` if the table changed.
    pub fn upsert(&self, record: DeviceRecord) -> bool {
        let mut devices = self.inner.devices.write();
        if devices.get(&record.name) == Some(&record) {
            return false;
        }
        debug!(name = %record.name, id = %record.id, "registry upsert");
        devices.insert(record.name.clone(), record);
        true
    }

    /// Remove the record for an entry name, returning it if present
    pub fn remove(&self, name: &str) -> Option<DeviceRecord> {
        let removed = self.inner.devices.write().remove(name);
        if removed.is_some() {
            debug!(name = %name, "registry remove");
        }
        removed
    }

    /// Owned copy of all records, ordered by entry name
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.inner.devices.read().values().cloned().collect()
    }

    /// Entry names currently registered, in order
    pub fn names(&self) -> Vec<String> {
        self.inner.devices.read().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<DeviceRecord> {
        self.inner.devices.read().get(name).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.devices.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.devices.read().is_empty()
    }

    /// Wake every subscriber so it re-reads the registry
    pub fn publish(&self) {
        self.inner.changes.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    /// Subscribe to change notifications
    ///
    /// The receiver starts with the current generation marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Current change generation
    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        *self.inner.changes.borrow()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, Health};
    use std::time::Duration;

    #[test]
    fn test_new_registry_is_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_upsert_and_snapshot() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(DeviceRecord::healthy("b")));
        assert!(registry.upsert(DeviceRecord::healthy("a")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");
        assert_eq!(snapshot[0].id, DeviceId::from_name("a"));
    }

    #[test]
    fn test_upsert_same_record_is_noop() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(DeviceRecord::healthy("a")));
        assert!(!registry.upsert(DeviceRecord::healthy("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_health() {
        let registry = DeviceRegistry::new();
        registry.upsert(DeviceRecord::healthy("a"));

        let mut sick = DeviceRecord::healthy("a");
        sick.health = Health::Unhealthy;
        assert!(registry.upsert(sick));
        assert_eq!(registry.get("a").unwrap().health, Health::Unhealthy);
    }

    #[test]
    fn test_remove() {
        let registry = DeviceRegistry::new();
        registry.upsert(DeviceRecord::healthy("a"));

        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.name, "a");
        assert!(!registry.contains("a"));
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let registry = DeviceRegistry::new();
        registry.upsert(DeviceRecord::healthy("a"));
        registry.upsert(DeviceRecord::healthy("b"));

        let snapshot = registry.snapshot();
        registry.remove("a");
        registry.upsert(DeviceRecord::healthy("c"));

        let names: Vec<_> = snapshot.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.names(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_block() {
        let registry = DeviceRegistry::new();
        for _ in 0..100 {
            registry.publish();
        }
        assert_eq!(registry.generation(), 100);
    }

    #[tokio::test]
    async fn test_publish_wakes_every_subscriber() {
        let registry = DeviceRegistry::new();
        let mut first = registry.subscribe();
        let mut second = registry.subscribe();

        registry.publish();

        tokio::time::timeout(Duration::from_secs(1), first.changed())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.changed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bursts_coalesce() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        registry.publish();
        registry.publish();
        registry.publish();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 3);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let registry = DeviceRegistry::new();
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    registry.upsert(DeviceRecord::healthy(format!("dev{i}")));
                    if i % 2 == 0 {
                        registry.remove(&format!("dev{i}"));
                    }
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = registry.snapshot();
                        assert!(snapshot.windows(2).all(|w| w[0].name < w[1].name));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.len(), 250);
    }
}
