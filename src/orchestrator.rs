use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::alerts::Notifier;
use crate::config::Config;
use crate::database::Database;
use crate::drives::Drive;
use crate::error::DriveCatError;
use crate::hasher::{Hasher, MountResolver};
use crate::progress::{ProgressReporter, ScanProgress};
use crate::scanner::{ScanMode, ScanOutcome, Scanner};
use crate::settings::ScanFilters;
use crate::thumb_cache::ThumbnailCache;
use crate::utils::Utils;
use crate::volumes::{MountedVolume, SystemVolumes, VolumeEvent, VolumeWatcher};
use crate::watcher::{ChangeEvent, ChangeNotifier};

/// Everything the orchestrator reacts to, funneled into one mailbox.
#[derive(Debug)]
pub enum OrchestratorEvent {
    Volume(VolumeEvent),
    Changes(ChangeEvent),
    ScanFinished {
        uuid: String,
        mode: ScanMode,
        retried: bool,
        result: Result<ScanOutcome, DriveCatError>,
    },
}

struct ActiveScan {
    cancel: Arc<AtomicBool>,
}

#[derive(Clone, Copy)]
struct PendingScan {
    retried: bool,
}

pub struct OrchestratorParams {
    pub batch_size: usize,
    pub progress_interval: u64,
    pub optimize_threshold: u64,
}

impl OrchestratorParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.scanner.batch_size,
            progress_interval: config.scanner.progress_interval,
            optimize_threshold: config.database.optimize_threshold,
        }
    }
}

/// Serializes scan work per volume: at most one scan per volume, newer
/// requests cancel and replace in-flight ones, and completed scans gate
/// the optimize/hash/thumbnail follow-ups.
pub struct Orchestrator {
    db: Arc<Database>,
    volumes: Arc<VolumeWatcher>,
    notifier: ChangeNotifier,
    hasher: Arc<Hasher>,
    thumbs: Arc<ThumbnailCache>,
    alerts: Arc<dyn Notifier>,
    params: OrchestratorParams,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    progress_tx: broadcast::Sender<ScanProgress>,

    running: HashMap<String, ActiveScan>,
    pending: HashMap<String, PendingScan>,
    /// Cumulative delta churn since the last optimize pass.
    delta_changes: u64,
    /// Cancels background hash/thumbnail passes on shutdown.
    followup_cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        volumes: Arc<VolumeWatcher>,
        notifier: ChangeNotifier,
        hasher: Arc<Hasher>,
        thumbs: Arc<ThumbnailCache>,
        alerts: Arc<dyn Notifier>,
        params: OrchestratorParams,
        events_tx: mpsc::Sender<OrchestratorEvent>,
        progress_tx: broadcast::Sender<ScanProgress>,
    ) -> Self {
        Self {
            db,
            volumes,
            notifier,
            hasher,
            thumbs,
            alerts,
            params,
            events_tx,
            progress_tx,
            running: HashMap::new(),
            pending: HashMap::new(),
            delta_changes: 0,
            followup_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    pub fn has_work(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn handle_event(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::Volume(VolumeEvent::Mounted(volume)) => self.on_mounted(volume),
            OrchestratorEvent::Volume(VolumeEvent::Unmounted(uuid)) => self.on_unmounted(&uuid),
            OrchestratorEvent::Changes(change) => self.on_changes(&change.volume_uuid),
            OrchestratorEvent::ScanFinished {
                uuid,
                mode,
                retried,
                result,
            } => self.on_scan_finished(&uuid, mode, retried, result),
        }
    }

    /// Cooperative teardown: cancel everything, drop subscriptions. Tasks
    /// observe the flags at their next batch boundary.
    pub fn shutdown(&mut self) {
        info!("Orchestrator shutting down");
        self.followup_cancel.store(true, Ordering::Release);
        self.pending.clear();
        for active in self.running.values() {
            active.cancel.store(true, Ordering::Release);
        }
        self.notifier.unsubscribe_all();
    }

    fn on_mounted(&mut self, volume: MountedVolume) {
        info!(
            "Mounted: {} ({}) at {}",
            volume.name,
            volume.uuid,
            volume.mount_path.display()
        );
        if let Err(e) = Drive::upsert_mounted(&self.db, &volume, Utils::unix_now()) {
            error!("Could not record mount of {}: {}", volume.uuid, e);
            return;
        }

        match Drive::get(&self.db, &volume.uuid) {
            Ok(Some(drive)) if drive.excluded() => {
                info!("Drive {} is excluded; not indexing", volume.uuid);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Could not load drive {}: {}", volume.uuid, e);
                return;
            }
        }

        // Losing the change stream is not fatal; the next mount event
        // re-subscribes and scans reconcile whatever was missed
        match ScanFilters::load(&self.db) {
            Ok(filters) => {
                if let Err(e) = self.notifier.subscribe(&volume, filters) {
                    warn!("No live updates for {}: {}", volume.uuid, e);
                }
            }
            Err(e) => warn!("Could not load filters for {}: {}", volume.uuid, e),
        }

        self.request_scan(&volume.uuid, false);
    }

    fn on_unmounted(&mut self, uuid: &str) {
        info!("Unmounted: {uuid}");
        self.notifier.unsubscribe(uuid);
        self.pending.remove(uuid);
        if let Some(active) = self.running.get(uuid) {
            active.cancel.store(true, Ordering::Release);
        }
    }

    fn on_changes(&mut self, uuid: &str) {
        if !self.volumes.is_connected(uuid) {
            return;
        }
        match Drive::get(&self.db, uuid) {
            Ok(Some(drive)) if drive.excluded() => {}
            Ok(Some(_)) => self.request_scan(uuid, false),
            Ok(None) => warn!("Changes for unknown drive {uuid}"),
            Err(e) => error!("Could not load drive {uuid}: {e}"),
        }
    }

    /// At most one scan per volume. A request for a busy volume cancels
    /// the in-flight run and queues the new one behind it.
    fn request_scan(&mut self, uuid: &str, retried: bool) {
        if let Some(active) = self.running.get(uuid) {
            active.cancel.store(true, Ordering::Release);
            self.pending.insert(uuid.to_string(), PendingScan { retried });
            return;
        }
        self.start_scan(uuid, retried);
    }

    fn start_scan(&mut self, uuid: &str, retried: bool) {
        let Some(volume) = self.volumes.get(uuid) else {
            warn!("Scan requested for {uuid} but it is not mounted");
            return;
        };

        let mode = match Drive::get(&self.db, uuid) {
            Ok(drive) => scan_mode_for(drive.as_ref()),
            Err(e) => {
                error!("Could not pick scan mode for {uuid}: {e}");
                return;
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.running.insert(
            uuid.to_string(),
            ActiveScan {
                cancel: Arc::clone(&cancel),
            },
        );

        info!("Starting {mode} scan of {uuid}");
        let db = Arc::clone(&self.db);
        let events_tx = self.events_tx.clone();
        let reporter = ProgressReporter::new(
            uuid,
            self.params.progress_interval,
            Some(self.progress_tx.clone()),
        );
        let batch_size = self.params.batch_size;
        let uuid = uuid.to_string();

        tokio::spawn(async move {
            let scan_uuid = uuid.clone();
            let result = tokio::task::spawn_blocking(move || {
                let filters = ScanFilters::load(&db)?;
                Scanner::scan(
                    &db, &volume, mode, &filters, batch_size, &reporter, &cancel,
                )
            })
            .await
            .unwrap_or_else(|e| Err(DriveCatError::Error(format!("Scan task died: {e}"))));

            let _ = events_tx
                .send(OrchestratorEvent::ScanFinished {
                    uuid: scan_uuid,
                    mode,
                    retried,
                    result,
                })
                .await;
        });
    }

    fn on_scan_finished(
        &mut self,
        uuid: &str,
        mode: ScanMode,
        retried: bool,
        result: Result<ScanOutcome, DriveCatError>,
    ) {
        self.running.remove(uuid);
        let drive_name = Drive::get(&self.db, uuid)
            .ok()
            .flatten()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| uuid.to_string());

        match result {
            Ok(outcome) if outcome.cancelled => {
                info!("Scan of {uuid} cancelled after {} entries", outcome.entries_seen);
            }
            Ok(outcome) => {
                info!(
                    "Scan of {uuid} complete: {} entries, +{} ~{} -{}",
                    outcome.entries_seen, outcome.inserted, outcome.updated, outcome.deleted
                );
                self.alerts.notify(
                    "Scan complete",
                    &format!("{drive_name}: {} files indexed", outcome.file_count),
                );
                self.run_optimize_policy(mode, &outcome);
                self.start_followups();
            }
            Err(e) if e.is_recoverable_corruption() && !retried => {
                warn!("Recoverable store failure scanning {uuid}: {e}");
                match self.db.recover() {
                    Ok(()) => {
                        // One retry; it lines up behind any queued request
                        self.pending
                            .entry(uuid.to_string())
                            .or_insert(PendingScan { retried: true });
                    }
                    Err(recover_err) => {
                        error!("Recovery failed: {recover_err}");
                        self.alerts.notify(
                            "Scan failed",
                            &format!("{drive_name}: {} error", e.class()),
                        );
                    }
                }
            }
            Err(e) => {
                error!("Scan of {uuid} failed: {e}");
                self.alerts.notify(
                    "Scan failed",
                    &format!("{drive_name}: {} error", e.class()),
                );
            }
        }

        if let Some(pending) = self.pending.remove(uuid) {
            if self.volumes.is_connected(uuid) {
                self.start_scan(uuid, pending.retried);
            }
        }
    }

    /// Full scans always optimize; delta churn accumulates until the
    /// threshold tips it over.
    fn run_optimize_policy(&mut self, mode: ScanMode, outcome: &ScanOutcome) {
        let due = match mode {
            ScanMode::Full => true,
            ScanMode::Delta => {
                self.delta_changes += outcome.changes();
                self.delta_changes >= self.params.optimize_threshold
            }
        };
        if due {
            if let Err(e) = self.db.optimize() {
                warn!("Optimize failed: {e}");
            }
            self.delta_changes = 0;
        }
    }

    /// Kick the hasher and the thumbnail filler. Both are idempotent and
    /// no-op when already running or disabled in settings.
    fn start_followups(&self) {
        let resolver_volumes = Arc::clone(&self.volumes);
        let resolver: MountResolver =
            Arc::new(move |uuid: &str| resolver_volumes.resolve(uuid));

        let hasher = Arc::clone(&self.hasher);
        let hash_resolver = Arc::clone(&resolver);
        let hash_cancel = Arc::clone(&self.followup_cancel);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = hasher.run(hash_resolver, &hash_cancel) {
                error!("Hash pass failed: {e}");
            }
        });

        let thumbs = Arc::clone(&self.thumbs);
        let thumb_cancel = Arc::clone(&self.followup_cancel);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = thumbs.fill_missing(resolver, &thumb_cancel) {
                error!("Thumbnail pass failed: {e}");
            }
        });
    }
}

/// Never-scanned drives get a full scan; everything else reconciles.
fn scan_mode_for(drive: Option<&Drive>) -> ScanMode {
    match drive.and_then(Drive::last_scan_date) {
        Some(_) => ScanMode::Delta,
        None => ScanMode::Full,
    }
}

/// Wire every component together and pump events until ctrl-c.
pub async fn run_service(
    db: Arc<Database>,
    thumbs_root: PathBuf,
    alerts: Arc<dyn Notifier>,
    config: &Config,
) -> Result<(), DriveCatError> {
    let volumes = VolumeWatcher::new(Arc::new(SystemVolumes));

    let (events_tx, mut events_rx) = mpsc::channel::<OrchestratorEvent>(256);
    let (volume_tx, mut volume_rx) = mpsc::channel::<VolumeEvent>(64);
    let (change_tx, mut change_rx) = mpsc::channel::<ChangeEvent>(64);
    let (progress_tx, _) = broadcast::channel::<ScanProgress>(1024);

    let notifier = ChangeNotifier::new(
        change_tx,
        Duration::from_secs(config.watcher.debounce_secs),
    );
    let hasher = Hasher::new(
        Arc::clone(&db),
        config.hasher.threads,
        config.hasher.min_file_size,
    );
    let thumbs = ThumbnailCache::new(
        Arc::clone(&db),
        thumbs_root,
        config.thumbnails.budget_bytes,
        config.thumbnails.long_edge,
        config.thumbnails.threads,
        Arc::new(crate::thumb_cache::ImageRenderer),
    );

    let mut orchestrator = Orchestrator::new(
        db,
        Arc::clone(&volumes),
        notifier,
        hasher,
        thumbs,
        alerts,
        OrchestratorParams::from_config(config),
        events_tx.clone(),
        progress_tx,
    );

    let volume_task = volumes.run(
        volume_tx,
        Duration::from_secs(config.watcher.poll_secs.max(1)),
    );

    // Progress frames are best-effort; a lagged subscriber just skips ahead
    let mut progress_rx = orchestrator.subscribe_progress();
    tokio::spawn(async move {
        loop {
            match progress_rx.recv().await {
                Ok(frame) if frame.completed => {
                    debug!(
                        "{}: scan complete, {} entries",
                        frame.volume_uuid, frame.entries_processed
                    );
                }
                Ok(frame) => {
                    debug!(
                        "{}: {} entries, at {}",
                        frame.volume_uuid, frame.entries_processed, frame.current_item
                    );
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let volume_fwd_tx = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = volume_rx.recv().await {
            if volume_fwd_tx
                .send(OrchestratorEvent::Volume(event))
                .await
                .is_err()
            {
                break;
            }
        }
    });
    let change_fwd_tx = events_tx;
    tokio::spawn(async move {
        while let Some(event) = change_rx.recv().await {
            if change_fwd_tx
                .send(OrchestratorEvent::Changes(event))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    info!("drivecat service running; waiting for drives");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                orchestrator.shutdown();
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => orchestrator.handle_event(event),
                None => break,
            }
        }
    }

    // Give cancelled scans a moment to commit their in-flight batches
    while orchestrator.has_work() {
        match tokio::time::timeout(Duration::from_secs(10), events_rx.recv()).await {
            Ok(Some(event)) => orchestrator.handle_event(event),
            Ok(None) | Err(_) => break,
        }
    }
    volume_task.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::test_support::RecordingNotifier;
    use crate::files::FileEntry;
    use crate::volumes::VolumeEnumerator;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedVolumes {
        volumes: Mutex<Vec<MountedVolume>>,
    }

    impl VolumeEnumerator for ScriptedVolumes {
        fn enumerate(&self) -> Vec<MountedVolume> {
            self.volumes.lock().unwrap().clone()
        }
    }

    struct Fixture {
        _db_dir: TempDir,
        _thumb_dir: TempDir,
        tree: TempDir,
        db: Arc<Database>,
        volumes: Arc<VolumeWatcher>,
        alerts: Arc<RecordingNotifier>,
        orchestrator: Orchestrator,
        events_rx: mpsc::Receiver<OrchestratorEvent>,
    }

    fn fixture() -> Fixture {
        let db_dir = TempDir::new().unwrap();
        let thumb_dir = TempDir::new().unwrap();
        let tree = TempDir::new().unwrap();
        let db = Arc::new(Database::open(db_dir.path()).unwrap());

        let enumerator = Arc::new(ScriptedVolumes {
            volumes: Mutex::new(vec![MountedVolume {
                uuid: "u1".to_string(),
                name: "Stick".to_string(),
                mount_path: tree.path().to_path_buf(),
                total_bytes: 1_000_000,
                used_bytes: 0,
            }]),
        });
        let volumes = VolumeWatcher::new(enumerator);
        volumes.poll();

        let (events_tx, events_rx) = mpsc::channel(64);
        let (change_tx, _change_rx) = mpsc::channel(64);
        let (progress_tx, _) = broadcast::channel(64);
        let alerts = Arc::new(RecordingNotifier::default());

        let orchestrator = Orchestrator::new(
            Arc::clone(&db),
            Arc::clone(&volumes),
            ChangeNotifier::new(change_tx, Duration::from_secs(10)),
            Hasher::new(Arc::clone(&db), 2, 1),
            ThumbnailCache::new(
                Arc::clone(&db),
                thumb_dir.path().to_path_buf(),
                1_000_000,
                64,
                1,
                Arc::new(crate::thumb_cache::ImageRenderer),
            ),
            Arc::clone(&alerts) as Arc<dyn Notifier>,
            OrchestratorParams {
                batch_size: 1000,
                progress_interval: 100,
                optimize_threshold: 50,
            },
            events_tx,
            progress_tx,
        );

        Fixture {
            _db_dir: db_dir,
            _thumb_dir: thumb_dir,
            tree,
            db,
            volumes,
            alerts,
            orchestrator,
            events_rx,
        }
    }

    fn mounted(fx: &Fixture) -> MountedVolume {
        fx.volumes.get("u1").unwrap()
    }

    #[test]
    fn test_scan_mode_rule() {
        assert_eq!(scan_mode_for(None), ScanMode::Full);
    }

    #[tokio::test]
    async fn test_mount_triggers_full_scan_then_delta() {
        let mut fx = fixture();
        fs::write(fx.tree.path().join("a.txt"), b"hello").unwrap();

        fx.orchestrator
            .handle_event(OrchestratorEvent::Volume(VolumeEvent::Mounted(mounted(&fx))));
        assert!(fx.orchestrator.has_work());

        let finished = fx.events_rx.recv().await.unwrap();
        let OrchestratorEvent::ScanFinished { ref mode, .. } = finished else {
            panic!("expected ScanFinished");
        };
        assert_eq!(*mode, ScanMode::Full);
        fx.orchestrator.handle_event(finished);
        assert!(!fx.orchestrator.has_work());

        assert_eq!(FileEntry::count_for_drive(&fx.db, "u1").unwrap(), 1);
        let drive = Drive::get(&fx.db, "u1").unwrap().unwrap();
        assert!(drive.last_scan_date().is_some());
        assert_eq!(drive.file_count(), 1);

        // Success notification carries the file count
        let messages = fx.alerts.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Scan complete");
        assert!(messages[0].1.contains("1 files"));

        // A change burst on the scanned drive now reconciles with a delta
        fx.orchestrator.handle_event(OrchestratorEvent::Changes(ChangeEvent {
            volume_uuid: "u1".to_string(),
            paths: Default::default(),
        }));
        let finished = fx.events_rx.recv().await.unwrap();
        let OrchestratorEvent::ScanFinished { ref mode, .. } = finished else {
            panic!("expected ScanFinished");
        };
        assert_eq!(*mode, ScanMode::Delta);
        fx.orchestrator.handle_event(finished);
    }

    #[tokio::test]
    async fn test_request_while_running_cancels_and_queues() {
        let mut fx = fixture();
        fs::write(fx.tree.path().join("a.txt"), b"hello").unwrap();
        Drive::upsert_mounted(&fx.db, &mounted(&fx), 1).unwrap();

        fx.orchestrator.request_scan("u1", false);
        let first_cancel = Arc::clone(&fx.orchestrator.running["u1"].cancel);

        fx.orchestrator.request_scan("u1", false);
        assert!(first_cancel.load(Ordering::Acquire));
        assert!(fx.orchestrator.pending.contains_key("u1"));

        // First scan finishes (cancelled or not); the pending one starts
        let finished = fx.events_rx.recv().await.unwrap();
        fx.orchestrator.handle_event(finished);
        assert!(fx.orchestrator.pending.is_empty());
        assert!(fx.orchestrator.has_work());

        let finished = fx.events_rx.recv().await.unwrap();
        fx.orchestrator.handle_event(finished);
        assert!(!fx.orchestrator.has_work());
    }

    #[tokio::test]
    async fn test_scan_failure_notifies_with_error_class() {
        let mut fx = fixture();
        // Mount path exists in the mirror but not on disk
        fs::remove_dir_all(fx.tree.path()).unwrap();

        fx.orchestrator.request_scan("u1", false);
        let finished = fx.events_rx.recv().await.unwrap();
        fx.orchestrator.handle_event(finished);

        let messages = fx.alerts.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Scan failed");
        assert!(messages[0].1.contains("filesystem"));
    }

    #[tokio::test]
    async fn test_excluded_drive_not_scanned_on_mount() {
        let mut fx = fixture();
        Drive::upsert_mounted(&fx.db, &mounted(&fx), 1).unwrap();
        Drive::set_excluded(&fx.db, "u1", true).unwrap();

        fx.orchestrator
            .handle_event(OrchestratorEvent::Volume(VolumeEvent::Mounted(mounted(&fx))));
        assert!(!fx.orchestrator.has_work());
    }

    #[tokio::test]
    async fn test_unmount_cancels_running_scan() {
        let mut fx = fixture();
        fs::write(fx.tree.path().join("a.txt"), b"hello").unwrap();
        Drive::upsert_mounted(&fx.db, &mounted(&fx), 1).unwrap();

        fx.orchestrator.request_scan("u1", false);
        let cancel = Arc::clone(&fx.orchestrator.running["u1"].cancel);

        fx.orchestrator
            .handle_event(OrchestratorEvent::Volume(VolumeEvent::Unmounted(
                "u1".to_string(),
            )));
        assert!(cancel.load(Ordering::Acquire));

        let finished = fx.events_rx.recv().await.unwrap();
        fx.orchestrator.handle_event(finished);
        assert!(!fx.orchestrator.has_work());
    }

    #[tokio::test]
    async fn test_delta_churn_accumulates_toward_optimize() {
        let mut fx = fixture();
        fx.orchestrator.params.optimize_threshold = 5;

        let outcome = ScanOutcome {
            inserted: 2,
            updated: 1,
            deleted: 0,
            ..Default::default()
        };
        fx.orchestrator.run_optimize_policy(ScanMode::Delta, &outcome);
        assert_eq!(fx.orchestrator.delta_changes, 3);

        fx.orchestrator.run_optimize_policy(ScanMode::Delta, &outcome);
        // Crossed the threshold; counter resets
        assert_eq!(fx.orchestrator.delta_changes, 0);

        // Full scans optimize unconditionally and reset the counter
        fx.orchestrator.run_optimize_policy(ScanMode::Delta, &outcome);
        fx.orchestrator
            .run_optimize_policy(ScanMode::Full, &ScanOutcome::default());
        assert_eq!(fx.orchestrator.delta_changes, 0);
    }
}
