use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DriveCatError;
use crate::settings::ScanFilters;
use crate::volumes::MountedVolume;

/// A debounced burst of filesystem changes on one volume. Paths are
/// volume-root-relative and already filtered.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub volume_uuid: String,
    pub paths: HashSet<PathBuf>,
}

struct VolumeSubscription {
    // Dropping the watcher tears down the OS stream
    _watcher: RecommendedWatcher,
    debounce_task: JoinHandle<()>,
}

/// Per-volume change-stream subscriptions. Raw OS events arrive on
/// notify's thread, get filtered at the boundary, and feed a per-volume
/// debounce buffer that flushes one `ChangeEvent` per quiet period.
pub struct ChangeNotifier {
    debounce: Duration,
    events_tx: mpsc::Sender<ChangeEvent>,
    subscriptions: Mutex<HashMap<String, VolumeSubscription>>,
}

impl ChangeNotifier {
    pub fn new(events_tx: mpsc::Sender<ChangeEvent>, debounce: Duration) -> Self {
        Self {
            debounce,
            events_tx,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to file-level events under the volume's mount path.
    /// Re-subscribing replaces the previous subscription.
    pub fn subscribe(
        &self,
        volume: &MountedVolume,
        filters: ScanFilters,
    ) -> Result<(), DriveCatError> {
        let uuid = volume.uuid.clone();
        let mount_path = volume.mount_path.clone();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let callback_mount = mount_path.clone();
        let callback_uuid = uuid.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        let paths =
                            relevant_paths(&event.kind, &event.paths, &callback_mount, &filters);
                        if !paths.is_empty() {
                            // Receiver gone means we are unsubscribing; drop silently
                            let _ = raw_tx.send(paths);
                        }
                    }
                    Err(e) => error!("Change stream error on {callback_uuid}: {e}"),
                }
            })?;
        watcher.watch(&mount_path, RecursiveMode::Recursive)?;

        let debounce_task = tokio::spawn(debounce_loop(
            uuid.clone(),
            raw_rx,
            self.events_tx.clone(),
            self.debounce,
        ));

        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(old) = subs.insert(
            uuid.clone(),
            VolumeSubscription {
                _watcher: watcher,
                debounce_task,
            },
        ) {
            old.debounce_task.abort();
        }
        debug!("Watching {} at {}", uuid, mount_path.display());
        Ok(())
    }

    /// Stop a volume's subscription: the OS stream closes, the pending
    /// debounce timer is cancelled, and any buffered paths are discarded.
    pub fn unsubscribe(&self, uuid: &str) {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(sub) = subs.remove(uuid) {
            sub.debounce_task.abort();
            debug!("Stopped watching {uuid}");
        }
    }

    pub fn unsubscribe_all(&self) {
        let mut subs = self.subscriptions.lock().unwrap();
        for (_, sub) in subs.drain() {
            sub.debounce_task.abort();
        }
    }
}

/// Keep creation, modification, removal, and rename events whose paths
/// survive the exclusion filters; everything is rebased to volume-relative.
fn relevant_paths(
    kind: &EventKind,
    paths: &[PathBuf],
    mount_path: &Path,
    filters: &ScanFilters,
) -> Vec<PathBuf> {
    if !matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return Vec::new();
    }

    paths
        .iter()
        .filter_map(|path| path.strip_prefix(mount_path).ok())
        .filter(|relative| !relative.as_os_str().is_empty())
        .filter(|relative| !filters.is_excluded_path(relative))
        .map(Path::to_path_buf)
        .collect()
}

/// Buffer incoming batches into a path set; every batch re-arms the quiet
/// timer. When the timer fires, the whole set goes out as one event.
async fn debounce_loop(
    volume_uuid: String,
    mut raw_rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    events_tx: mpsc::Sender<ChangeEvent>,
    debounce: Duration,
) {
    let mut buffer: HashSet<PathBuf> = HashSet::new();
    let sleep = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            batch = raw_rx.recv() => match batch {
                Some(paths) => {
                    buffer.extend(paths);
                    sleep.as_mut().reset(tokio::time::Instant::now() + debounce);
                }
                None => break,
            },
            // The guard keeps the expired timer from being polled while
            // the buffer is empty
            _ = &mut sleep, if !buffer.is_empty() => {
                let paths = std::mem::take(&mut buffer);
                debug!(
                    "Changes detected on {}: {} path(s)",
                    volume_uuid,
                    paths.len()
                );
                let event = ChangeEvent {
                    volume_uuid: volume_uuid.clone(),
                    paths,
                };
                if events_tx.send(event).await.is_err() {
                    warn!("Change listener gone; stopping debounce for {volume_uuid}");
                    break;
                }
            }
        }
    }
}
