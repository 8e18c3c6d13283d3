use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A volume currently reachable through the filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountedVolume {
    /// OS-reported stable identifier; survives remounts and reboots.
    pub uuid: String,
    pub name: String,
    pub mount_path: PathBuf,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Clone, Debug)]
pub enum VolumeEvent {
    Mounted(MountedVolume),
    Unmounted(String),
}

/// Source of the current mount set. The system implementation reads the OS
/// mount table; tests substitute a scripted one.
pub trait VolumeEnumerator: Send + Sync {
    fn enumerate(&self) -> Vec<MountedVolume>;
}

/// Tracks mounted volumes, emits mount/unmount events as the set changes,
/// and answers `resolve` from an in-memory mirror.
pub struct VolumeWatcher {
    enumerator: Arc<dyn VolumeEnumerator>,
    mounts: RwLock<HashMap<String, MountedVolume>>,
}

impl VolumeWatcher {
    pub fn new(enumerator: Arc<dyn VolumeEnumerator>) -> Arc<Self> {
        Arc::new(Self {
            enumerator,
            mounts: RwLock::new(HashMap::new()),
        })
    }

    /// Best-effort lookup over currently mounted volumes.
    pub fn resolve(&self, uuid: &str) -> Option<PathBuf> {
        self.mounts
            .read()
            .unwrap()
            .get(uuid)
            .map(|v| v.mount_path.clone())
    }

    pub fn is_connected(&self, uuid: &str) -> bool {
        self.mounts.read().unwrap().contains_key(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<MountedVolume> {
        self.mounts.read().unwrap().get(uuid).cloned()
    }

    pub fn mounted(&self) -> Vec<MountedVolume> {
        self.mounts.read().unwrap().values().cloned().collect()
    }

    /// Re-enumerate, diff against the mirror, and return the transitions in
    /// the order the OS reported them.
    pub fn poll(&self) -> Vec<VolumeEvent> {
        let current = self.enumerator.enumerate();
        let mut events = Vec::new();
        let mut mounts = self.mounts.write().unwrap();

        for volume in &current {
            let known = mounts.get(&volume.uuid);
            if known.is_none() {
                debug!(
                    "Volume mounted: {} ({}) at {}",
                    volume.name,
                    volume.uuid,
                    volume.mount_path.display()
                );
                events.push(VolumeEvent::Mounted(volume.clone()));
            }
            mounts.insert(volume.uuid.clone(), volume.clone());
        }

        let current_uuids: HashMap<&str, ()> =
            current.iter().map(|v| (v.uuid.as_str(), ())).collect();
        let gone: Vec<String> = mounts
            .keys()
            .filter(|uuid| !current_uuids.contains_key(uuid.as_str()))
            .cloned()
            .collect();
        for uuid in gone {
            debug!("Volume unmounted: {uuid}");
            mounts.remove(&uuid);
            events.push(VolumeEvent::Unmounted(uuid));
        }

        events
    }

    /// Poll loop feeding the orchestrator. Exits when the receiver is gone.
    pub fn run(
        self: Arc<Self>,
        tx: mpsc::Sender<VolumeEvent>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                let watcher = Arc::clone(&self);
                let events = tokio::task::spawn_blocking(move || watcher.poll())
                    .await
                    .unwrap_or_default();
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

/// Reads the OS mount table via sysinfo, keeps external volumes that have a
/// stable identifier, and filters out the system disk and virtual mounts.
pub struct SystemVolumes;

impl VolumeEnumerator for SystemVolumes {
    fn enumerate(&self) -> Vec<MountedVolume> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut volumes = Vec::new();

        for disk in disks.list() {
            let mount_path = disk.mount_point().to_path_buf();
            if !is_external_mount(&mount_path, disk.is_removable()) {
                continue;
            }

            // A volume we cannot re-identify later cannot be indexed
            let Some(uuid) = stable_volume_uuid(disk.name(), &mount_path) else {
                debug!(
                    "Ignoring volume without stable identifier: {}",
                    mount_path.display()
                );
                continue;
            };

            let name = mount_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| disk.name().to_string_lossy().into_owned());
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());

            volumes.push(MountedVolume {
                uuid,
                name,
                mount_path,
                total_bytes: total,
                used_bytes: used,
            });
        }

        volumes
    }
}

/// Internal volumes (the system disk, virtual mounts) are never indexed.
fn is_external_mount(mount_path: &Path, removable: bool) -> bool {
    if mount_path == Path::new("/") {
        return false;
    }
    if removable {
        return true;
    }
    ["/Volumes", "/media", "/mnt", "/run/media"]
        .iter()
        .any(|prefix| mount_path.starts_with(prefix))
}

#[cfg(target_os = "linux")]
fn stable_volume_uuid(device: &std::ffi::OsStr, _mount_path: &Path) -> Option<String> {
    uuid_from_by_uuid_dir(Path::new("/dev/disk/by-uuid"), Path::new(device))
}

#[cfg(target_os = "macos")]
fn stable_volume_uuid(_device: &std::ffi::OsStr, mount_path: &Path) -> Option<String> {
    let output = std::process::Command::new("diskutil")
        .arg("info")
        .arg(mount_path)
        .output()
        .ok()?;
    if !output.status.success() {
        warn!("diskutil info failed for {}", mount_path.display());
        return None;
    }
    parse_diskutil_uuid(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn stable_volume_uuid(_device: &std::ffi::OsStr, _mount_path: &Path) -> Option<String> {
    None
}

/// Match a block device against the by-uuid symlink farm. The symlink name
/// is the filesystem UUID.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn uuid_from_by_uuid_dir(by_uuid_dir: &Path, device: &Path) -> Option<String> {
    let canonical_device = dunce::canonicalize(device).ok()?;
    let entries = std::fs::read_dir(by_uuid_dir).ok()?;
    for entry in entries.flatten() {
        if let Ok(target) = dunce::canonicalize(entry.path()) {
            if target == canonical_device {
                return Some(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    warn!("No filesystem UUID found for {}", device.display());
    None
}

/// Pull "Volume UUID: XXXX-..." out of `diskutil info` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_diskutil_uuid(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Volume UUID:") {
            let uuid = rest.trim();
            if !uuid.is_empty() {
                return Some(uuid.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub struct ScriptedVolumes {
        pub volumes: Mutex<Vec<MountedVolume>>,
    }

    impl VolumeEnumerator for ScriptedVolumes {
        fn enumerate(&self) -> Vec<MountedVolume> {
            self.volumes.lock().unwrap().clone()
        }
    }

    fn volume(uuid: &str, mount: &str) -> MountedVolume {
        MountedVolume {
            uuid: uuid.to_string(),
            name: format!("vol-{uuid}"),
            mount_path: PathBuf::from(mount),
            total_bytes: 1000,
            used_bytes: 100,
        }
    }

    #[test]
    fn test_poll_emits_mount_and_unmount() {
        let enumerator = Arc::new(ScriptedVolumes {
            volumes: Mutex::new(vec![volume("u1", "/media/a")]),
        });
        let watcher = VolumeWatcher::new(enumerator.clone());

        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], VolumeEvent::Mounted(v) if v.uuid == "u1"));
        assert!(watcher.is_connected("u1"));
        assert_eq!(watcher.resolve("u1"), Some(PathBuf::from("/media/a")));

        // Steady state: no events
        assert!(watcher.poll().is_empty());

        // Swap u1 for u2
        *enumerator.volumes.lock().unwrap() = vec![volume("u2", "/media/b")];
        let events = watcher.poll();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], VolumeEvent::Mounted(v) if v.uuid == "u2"));
        assert!(matches!(&events[1], VolumeEvent::Unmounted(uuid) if uuid == "u1"));
        assert!(!watcher.is_connected("u1"));
        assert_eq!(watcher.resolve("u1"), None);
    }

    #[test]
    fn test_remount_updates_mirror() {
        let enumerator = Arc::new(ScriptedVolumes {
            volumes: Mutex::new(vec![volume("u1", "/media/a")]),
        });
        let watcher = VolumeWatcher::new(enumerator.clone());
        watcher.poll();

        // Same volume returns at a different mount point without unmount
        // having been observed; the mirror follows silently.
        *enumerator.volumes.lock().unwrap() = vec![volume("u1", "/media/a1")];
        assert!(watcher.poll().is_empty());
        assert_eq!(watcher.resolve("u1"), Some(PathBuf::from("/media/a1")));
    }

    #[test]
    fn test_internal_mounts_filtered() {
        assert!(!is_external_mount(Path::new("/"), false));
        assert!(!is_external_mount(Path::new("/home"), false));
        assert!(is_external_mount(Path::new("/media/usb"), false));
        assert!(is_external_mount(Path::new("/Volumes/Stick"), false));
        assert!(is_external_mount(Path::new("/run/media/me/Stick"), false));
        // Removable beats the prefix check
        assert!(is_external_mount(Path::new("/opt/dock"), true));
    }

    #[test]
    fn test_parse_diskutil_uuid() {
        let output = "\
   Device Identifier:         disk2s1
   Volume Name:               STICK
   Volume UUID:               0FA6A2D2-3C14-3E5A-B02C-D945B44EAF2F
   Disk Size:                 15.5 GB
";
        assert_eq!(
            parse_diskutil_uuid(output).as_deref(),
            Some("0FA6A2D2-3C14-3E5A-B02C-D945B44EAF2F")
        );
        assert_eq!(parse_diskutil_uuid("no uuid here"), None);
        assert_eq!(parse_diskutil_uuid("   Volume UUID:   \n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_uuid_from_by_uuid_dir() {
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let device = dir.path().join("sda1");
        std::fs::write(&device, b"").unwrap();

        let by_uuid = dir.path().join("by-uuid");
        std::fs::create_dir(&by_uuid).unwrap();
        std::os::unix::fs::symlink(&device, by_uuid.join("ABCD-1234")).unwrap();

        assert_eq!(
            uuid_from_by_uuid_dir(&by_uuid, &device).as_deref(),
            Some("ABCD-1234")
        );

        let other = dir.path().join("sdb1");
        std::fs::write(&other, b"").unwrap();
        assert_eq!(uuid_from_by_uuid_dir(&by_uuid, &other), None);
    }

    #[tokio::test]
    async fn test_run_forwards_events() {
        let enumerator = Arc::new(ScriptedVolumes {
            volumes: Mutex::new(vec![volume("u1", "/media/a")]),
        });
        let watcher = VolumeWatcher::new(enumerator);
        let (tx, mut rx) = mpsc::channel(8);

        let handle = watcher.run(tx, Duration::from_millis(10));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, VolumeEvent::Mounted(v) if v.uuid == "u1"));

        drop(rx);
        // Sender failure ends the loop
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
