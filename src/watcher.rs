//! Device directory watcher
//!
//! Keeps the [`DeviceRegistry`] in sync with the non-directory entries of the
//! device directory. The inotify watch is installed before the initial scan so
//! no entry created in between is missed; a create event for an entry the scan
//! already saw is a no-op upsert.

use crate::device::DeviceRecord;
use crate::error::{PluginError, Result};
use crate::registry::DeviceRegistry;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches the device directory and feeds the registry
pub struct DeviceWatcher {
    dir: PathBuf,
    registry: DeviceRegistry,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    // Dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
}

impl DeviceWatcher {
    /// Install the watch on `dir`, then load its current entries
    ///
    /// Fails if the directory cannot be watched or listed.
    pub fn start(dir: impl Into<PathBuf>, registry: DeviceRegistry) -> Result<Self> {
        let dir = dir.into();
        let (tx, events) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver gone means the watcher is shutting down
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let this = Self {
            dir,
            registry,
            events,
            _watcher: watcher,
        };
        this.scan()?;
        Ok(this)
    }

    /// Reconcile the registry with the non-directory entries of the directory
    ///
    /// Stale keys are removed and new entries added. Publishes once if
    /// anything changed and returns the number of changes.
    pub fn scan(&self) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| PluginError::DeviceScan {
            path: self.dir.clone(),
            source,
        })?;

        let mut present = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| PluginError::DeviceScan {
                path: self.dir.clone(),
                source,
            })?;
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => {}
                Ok(_) => {
                    present.insert(entry.file_name().to_string_lossy().into_owned());
                }
                Err(e) => {
                    warn!(entry = %entry.path().display(), error = %e, "cannot stat device entry");
                }
            }
        }

        let mut changed = 0;
        for name in self.registry.names() {
            if !present.contains(&name) && self.registry.remove(&name).is_some() {
                info!(device = %name, "device gone since last scan");
                changed += 1;
            }
        }
        for name in present {
            if self.registry.upsert(DeviceRecord::healthy(name)) {
                changed += 1;
            }
        }

        if changed > 0 {
            self.registry.publish();
        }
        info!(
            dir = %self.dir.display(),
            devices = self.registry.len(),
            changed,
            "device directory scanned"
        );
        Ok(changed)
    }

    /// Apply filesystem events until `cancel` fires
    ///
    /// Watch errors are logged and skipped. Returns
    /// [`PluginError::WatchClosed`] if the event source goes away.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("device watcher stopped");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Some(Ok(event)) => self.handle_event(&event),
                    Some(Err(e)) => error!(error = %e, "device watch error"),
                    None => return Err(PluginError::WatchClosed),
                },
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        // Events were dropped (queue overflow); only a full rescan is reliable
        if event.need_rescan() {
            warn!("device watch lost events, rescanning");
            if let Err(e) = self.scan() {
                error!(error = %e, "device rescan failed");
            }
            return;
        }

        let changed = match event.kind {
            EventKind::Create(_) => self.added(event.paths.iter()),
            EventKind::Remove(_) => self.removed(event.paths.iter()),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.removed(event.paths.iter())
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => self.added(event.paths.iter()),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let removed = self.removed(event.paths.first());
                let added = self.added(event.paths.get(1));
                removed || added
            }
            _ => false,
        };

        if changed {
            self.registry.publish();
        }
    }

    fn added<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> bool {
        let mut changed = false;
        for path in paths {
            let Some(name) = self.entry_name(path) else {
                continue;
            };
            match std::fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "created entry vanished");
                    continue;
                }
            }
            if self.registry.upsert(DeviceRecord::healthy(name.clone())) {
                info!(device = %name, "device added");
                changed = true;
            }
        }
        changed
    }

    fn removed<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> bool {
        let mut changed = false;
        for path in paths {
            let Some(name) = self.entry_name(path) else {
                continue;
            };
            if self.registry.remove(&name).is_some() {
                info!(device = %name, "device removed");
                changed = true;
            }
        }
        changed
    }

    /// Entry name for a path directly inside the device directory
    fn entry_name(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.dir.as_path()) {
            return None;
        }
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use notify::event::{CreateKind, Flag, RemoveKind};
    use std::time::Duration;

    fn watcher_in(dir: &Path) -> (DeviceWatcher, DeviceRegistry) {
        let registry = DeviceRegistry::new();
        let watcher = DeviceWatcher::start(dir, registry.clone()).unwrap();
        (watcher, registry)
    }

    async fn wait_for(registry: &DeviceRegistry, check: impl Fn(&DeviceRegistry) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(registry) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_scan_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let (_watcher, registry) = watcher_in(dir.path());

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.get("a").unwrap().id, DeviceId::from_name("a"));
        assert_eq!(registry.generation(), 1);
    }

    #[test]
    fn test_empty_directory_does_not_publish() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, registry) = watcher_in(dir.path());
        assert!(registry.is_empty());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = DeviceWatcher::start(dir.path().join("absent"), DeviceRegistry::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_handle_create_and_remove_events() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        let path = dir.path().join("c");
        std::fs::write(&path, b"").unwrap();
        watcher.handle_event(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone()),
        );
        assert!(registry.contains("c"));
        assert_eq!(registry.generation(), 1);

        // Duplicate create is a no-op
        watcher.handle_event(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone()),
        );
        assert_eq!(registry.generation(), 1);

        watcher.handle_event(&Event::new(EventKind::Remove(RemoveKind::File)).add_path(path));
        assert!(!registry.contains("c"));
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_remove_of_unknown_entry_does_not_publish() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        watcher.handle_event(
            &Event::new(EventKind::Remove(RemoveKind::Any)).add_path(dir.path().join("ghost")),
        );
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_rename_within_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old"), b"").unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        std::fs::rename(dir.path().join("old"), dir.path().join("new")).unwrap();
        watcher.handle_event(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(dir.path().join("old"))
                .add_path(dir.path().join("new")),
        );

        assert_eq!(registry.names(), vec!["new".to_string()]);
    }

    #[test]
    fn test_created_directory_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        watcher.handle_event(&Event::new(EventKind::Create(CreateKind::Folder)).add_path(sub));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_paths_outside_directory_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let stray = other.path().join("x");
        std::fs::write(&stray, b"").unwrap();

        let (watcher, registry) = watcher_in(dir.path());
        watcher.handle_event(&Event::new(EventKind::Create(CreateKind::File)).add_path(stray));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_tracks_live_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        std::fs::write(dir.path().join("b"), b"").unwrap();
        wait_for(&registry, |r| r.contains("b")).await;

        std::fs::remove_file(dir.path().join("a")).unwrap();
        wait_for(&registry, |r| !r.contains("a")).await;

        assert_eq!(registry.names(), vec!["b".to_string()]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    fn entries_on_disk(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| !e.file_type().unwrap().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_overflow_rescan_reconciles_registry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        let (watcher, registry) = watcher_in(dir.path());
        let before = registry.generation();

        // Changes whose events were lost
        std::fs::remove_file(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        watcher.handle_event(&Event::new(EventKind::Other).set_flag(Flag::Rescan));

        assert_eq!(registry.names(), vec!["b".to_string()]);
        assert_eq!(registry.generation(), before + 1);
    }

    #[test]
    fn test_scan_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        let (watcher, registry) = watcher_in(dir.path());

        std::fs::remove_file(dir.path().join("a")).unwrap();
        assert_eq!(watcher.scan().unwrap(), 1);
        assert_eq!(registry.names(), vec!["b".to_string()]);

        // Nothing changed, nothing published
        let generation = registry.generation();
        assert_eq!(watcher.scan().unwrap(), 0);
        assert_eq!(registry.generation(), generation);
    }

    #[tokio::test]
    async fn test_run_settles_to_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let (watcher, registry) = watcher_in(dir.path());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        let path = |name: &str| dir.path().join(name);
        std::fs::write(path("d"), b"").unwrap();
        std::fs::remove_file(path("a")).unwrap();
        std::fs::rename(path("b"), path("e")).unwrap();
        std::fs::create_dir(path("sub")).unwrap();
        std::fs::write(path("f"), b"").unwrap();
        std::fs::remove_file(path("f")).unwrap();
        std::fs::write(path("a"), b"").unwrap();
        std::fs::rename(path("c"), path("sub").join("c")).unwrap();

        let expected = entries_on_disk(dir.path());
        assert_eq!(expected, vec!["a".to_string(), "d".to_string(), "e".to_string()]);
        wait_for(&registry, |r| r.names() == expected).await;

        // Settled: no late event moves it away again
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.names(), expected);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
