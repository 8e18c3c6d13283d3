use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn, Level};
use logging_timer::timer;

use crate::database::Database;
use crate::drives::Drive;
use crate::error::DriveCatError;
use crate::files::{FileEntry, FileRecord, FileUpdate};
use crate::progress::ProgressReporter;
use crate::settings::{is_package_dir, ScanFilters};
use crate::utils::Utils;
use crate::volumes::MountedVolume;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScanMode {
    Full,
    Delta,
}

#[derive(Debug, Default, Clone)]
pub struct ScanOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub entries_seen: u64,
    pub file_count: i64,
    pub cancelled: bool,
}

impl ScanOutcome {
    /// Mutations applied; feeds the orchestrator's optimize accounting.
    pub fn changes(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

struct QueueEntry {
    path: PathBuf,
    is_root: bool,
}

pub struct Scanner;

impl Scanner {
    /// Walk the mounted volume and bring the stored inventory into
    /// agreement with what is on disk. Mode selection belongs to the
    /// orchestrator; both modes are exposed here.
    pub fn scan(
        db: &Database,
        volume: &MountedVolume,
        mode: ScanMode,
        filters: &ScanFilters,
        batch_size: usize,
        reporter: &ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<ScanOutcome, DriveCatError> {
        let _tmr = timer!(Level::Debug; "Scanner::scan");
        debug!(
            "Starting {} scan of {} at {}",
            mode,
            volume.uuid,
            volume.mount_path.display()
        );

        match mode {
            ScanMode::Full => Self::full_scan(db, volume, filters, batch_size, reporter, cancel),
            ScanMode::Delta => Self::delta_scan(db, volume, filters, batch_size, reporter, cancel),
        }
    }

    fn full_scan(
        db: &Database,
        volume: &MountedVolume,
        filters: &ScanFilters,
        batch_size: usize,
        reporter: &ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<ScanOutcome, DriveCatError> {
        let orphaned = FileEntry::clear_drive(db, &volume.uuid)?;
        remove_thumbnail_files(&orphaned);

        let mut outcome = ScanOutcome::default();
        let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_size);

        let walk_result = walk(volume, filters, reporter, |record| {
            outcome.entries_seen += 1;
            batch.push(record);
            if batch.len() >= batch_size {
                FileEntry::insert_batch(db, &batch)?;
                outcome.inserted += batch.len() as u64;
                batch.clear();
                if cancel.load(Ordering::Acquire) {
                    return Err(DriveCatError::ScanCancelled);
                }
            }
            Ok(())
        });

        match walk_result {
            Ok(()) => {}
            Err(DriveCatError::ScanCancelled) => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }

        FileEntry::insert_batch(db, &batch)?;
        outcome.inserted += batch.len() as u64;

        Self::finish(db, volume, &mut outcome, reporter)?;
        Ok(outcome)
    }

    fn delta_scan(
        db: &Database,
        volume: &MountedVolume,
        filters: &ScanFilters,
        batch_size: usize,
        reporter: &ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<ScanOutcome, DriveCatError> {
        let existing = FileEntry::existing_for_drive(db, &volume.uuid)?;
        let mut visited: HashSet<String> = HashSet::with_capacity(existing.len());

        let mut outcome = ScanOutcome::default();
        let mut inserts: Vec<FileRecord> = Vec::with_capacity(batch_size);
        let mut updates: Vec<FileUpdate> = Vec::with_capacity(batch_size);

        let walk_result = walk(volume, filters, reporter, |record| {
            outcome.entries_seen += 1;
            visited.insert(record.relative_path.clone());

            match existing.get(&record.relative_path) {
                None => inserts.push(record),
                Some(stored) => {
                    // Filesystems round timestamps; a 1s tolerance keeps
                    // those from reading as modifications
                    if mtime_differs(stored.modified_at, record.modified_at) {
                        updates.push(FileUpdate {
                            id: stored.id,
                            name: record.name,
                            size: record.size,
                            created_at: record.created_at,
                            modified_at: record.modified_at,
                        });
                    }
                }
            }

            if inserts.len() >= batch_size {
                FileEntry::insert_batch(db, &inserts)?;
                outcome.inserted += inserts.len() as u64;
                inserts.clear();
                if cancel.load(Ordering::Acquire) {
                    return Err(DriveCatError::ScanCancelled);
                }
            }
            if updates.len() >= batch_size {
                FileEntry::update_batch(db, &updates)?;
                outcome.updated += updates.len() as u64;
                updates.clear();
                if cancel.load(Ordering::Acquire) {
                    return Err(DriveCatError::ScanCancelled);
                }
            }
            Ok(())
        });

        match walk_result {
            Ok(()) => {}
            Err(DriveCatError::ScanCancelled) => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }

        FileEntry::insert_batch(db, &inserts)?;
        outcome.inserted += inserts.len() as u64;
        FileEntry::update_batch(db, &updates)?;
        outcome.updated += updates.len() as u64;

        // Everything stored but not observed is gone from disk
        let deleted: Vec<String> = existing
            .keys()
            .filter(|path| !visited.contains(*path))
            .cloned()
            .collect();
        for chunk in deleted.chunks(batch_size) {
            if cancel.load(Ordering::Acquire) {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            let orphaned = FileEntry::delete_batch(db, &volume.uuid, chunk)?;
            remove_thumbnail_files(&orphaned);
            outcome.deleted += chunk.len() as u64;
        }

        Self::finish(db, volume, &mut outcome, reporter)?;
        Ok(outcome)
    }

    fn finish(
        db: &Database,
        volume: &MountedVolume,
        outcome: &mut ScanOutcome,
        reporter: &ProgressReporter,
    ) -> Result<(), DriveCatError> {
        outcome.file_count = FileEntry::count_for_drive(db, &volume.uuid)?;
        Drive::set_last_scan(db, &volume.uuid, Utils::unix_now(), outcome.file_count)?;
        reporter.complete();
        debug!(
            "Scan of {} done: +{} ~{} -{} ({} entries)",
            volume.uuid, outcome.inserted, outcome.updated, outcome.deleted, outcome.entries_seen
        );
        Ok(())
    }
}

fn mtime_differs(stored: Option<i64>, observed: Option<i64>) -> bool {
    match (stored, observed) {
        (Some(a), Some(b)) => (a - b).abs() > 1,
        (None, None) => false,
        _ => true,
    }
}

/// Breadth-first traversal of the volume. Per-entry failures are logged and
/// skipped; an enumeration failure at the mount root aborts the scan, below
/// the root it only skips the failing subtree.
fn walk<F>(
    volume: &MountedVolume,
    filters: &ScanFilters,
    reporter: &ProgressReporter,
    mut visit: F,
) -> Result<(), DriveCatError>
where
    F: FnMut(FileRecord) -> Result<(), DriveCatError>,
{
    let root = &volume.mount_path;
    fs::symlink_metadata(root)?;

    let mut queue = VecDeque::new();
    queue.push_back(QueueEntry {
        path: root.clone(),
        is_root: true,
    });

    while let Some(dir) = queue.pop_front() {
        let entries = match fs::read_dir(&dir.path) {
            Ok(entries) => entries,
            Err(e) if dir.is_root => return Err(e.into()),
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.path.display(), e);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.path.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            // Hidden per unix convention
            if is_hidden(&name) {
                continue;
            }

            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if metadata.is_dir() {
                if filters.is_excluded_dir(&name) {
                    continue;
                }
                let record = make_record(volume, root, &path, &name, &metadata, true);
                reporter.on_entry(&name);
                // Bundles are opaque leaves: recorded, never descended
                if !is_package_dir(&name) {
                    queue.push_back(QueueEntry {
                        path,
                        is_root: false,
                    });
                }
                visit(record)?;
            } else if metadata.is_file() {
                if filters.is_excluded_file(&name) {
                    continue;
                }
                let record = make_record(volume, root, &path, &name, &metadata, false);
                reporter.on_entry(&name);
                visit(record)?;
            }
            // Symlinks and special files are not indexed
        }
    }

    Ok(())
}

fn is_hidden(name: &str) -> bool {
    // Leading dot is the whole convention on unix; Windows hidden
    // attributes are reconciled by the exclusion sets instead
    name.starts_with('.')
}

fn make_record(
    volume: &MountedVolume,
    root: &Path,
    path: &Path,
    name: &str,
    metadata: &fs::Metadata,
    is_directory: bool,
) -> FileRecord {
    let relative_path = path
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.to_string());

    FileRecord {
        drive_uuid: volume.uuid.clone(),
        name: name.to_string(),
        relative_path,
        size: if is_directory {
            None
        } else {
            Some(metadata.len() as i64)
        },
        created_at: metadata.created().ok().and_then(Utils::system_time_to_unix),
        modified_at: metadata.modified().ok().and_then(Utils::system_time_to_unix),
        is_directory,
    }
}

fn remove_thumbnail_files(paths: &[String]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove thumbnail {path}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn set_mtime(path: &Path, unix_secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(unix_secs))
            .unwrap();
    }

    fn setup(tree: &TempDir) -> (Database, MountedVolume, TempDir) {
        let db_dir = TempDir::new().unwrap();
        let db = Database::open(db_dir.path()).unwrap();
        let volume = MountedVolume {
            uuid: "u1".to_string(),
            name: "Stick".to_string(),
            mount_path: tree.path().to_path_buf(),
            total_bytes: 1_000_000,
            used_bytes: 100,
        };
        Drive::upsert_mounted(&db, &volume, 1).unwrap();
        (db, volume, db_dir)
    }

    fn scan(
        db: &Database,
        volume: &MountedVolume,
        mode: ScanMode,
    ) -> ScanOutcome {
        let reporter = ProgressReporter::silent(&volume.uuid);
        let cancel = AtomicBool::new(false);
        Scanner::scan(
            db,
            volume,
            mode,
            &ScanFilters::defaults(),
            1000,
            &reporter,
            &cancel,
        )
        .unwrap()
    }

    #[test]
    fn test_full_scan_indexes_tree() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(tree.path().join("b")).unwrap();
        fs::write(tree.path().join("b/c.txt"), b"01234567890123456789").unwrap();

        let (db, volume, _guard) = setup(&tree);
        let outcome = scan(&db, &volume, ScanMode::Full);

        assert_eq!(outcome.inserted, 3); // a.txt, b, b/c.txt
        assert!(!outcome.cancelled);
        assert_eq!(outcome.file_count, 3);

        let a = FileEntry::get_by_path(&db, "u1", "a.txt").unwrap().unwrap();
        assert_eq!(a.size, Some(10));
        assert!(!a.is_directory);

        let b = FileEntry::get_by_path(&db, "u1", "b").unwrap().unwrap();
        assert!(b.is_directory);
        assert_eq!(b.size, None);

        let drive = Drive::get(&db, "u1").unwrap().unwrap();
        assert!(drive.last_scan_date().is_some());
        assert_eq!(drive.file_count(), 3);
    }

    #[test]
    fn test_exclusions_and_hidden() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("keep.txt"), b"x").unwrap();
        fs::write(tree.path().join("drop.tmp"), b"x").unwrap();
        fs::write(tree.path().join(".hidden"), b"x").unwrap();
        fs::create_dir(tree.path().join("node_modules")).unwrap();
        fs::write(tree.path().join("node_modules/dep.js"), b"x").unwrap();

        let (db, volume, _guard) = setup(&tree);
        let outcome = scan(&db, &volume, ScanMode::Full);

        assert_eq!(outcome.inserted, 1);
        assert!(FileEntry::get_by_path(&db, "u1", "keep.txt").unwrap().is_some());
        assert!(FileEntry::get_by_path(&db, "u1", "drop.tmp").unwrap().is_none());
        assert!(FileEntry::get_by_path(&db, "u1", "node_modules").unwrap().is_none());
    }

    #[test]
    fn test_package_dir_is_opaque_leaf() {
        let tree = TempDir::new().unwrap();
        fs::create_dir(tree.path().join("Things.app")).unwrap();
        fs::write(tree.path().join("Things.app/binary"), b"x").unwrap();

        let (db, volume, _guard) = setup(&tree);
        let outcome = scan(&db, &volume, ScanMode::Full);

        assert_eq!(outcome.inserted, 1);
        let bundle = FileEntry::get_by_path(&db, "u1", "Things.app").unwrap().unwrap();
        assert!(bundle.is_directory);
    }

    #[test]
    fn test_full_then_delta_reconciles() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"0123456789").unwrap();
        set_mtime(&tree.path().join("a.txt"), 100);
        fs::create_dir(tree.path().join("b")).unwrap();
        fs::write(tree.path().join("b/c.txt"), b"01234567890123456789").unwrap();
        set_mtime(&tree.path().join("b/c.txt"), 200);

        let (db, volume, _guard) = setup(&tree);
        let full = scan(&db, &volume, ScanMode::Full);
        assert_eq!(full.inserted, 3);

        let a_id = FileEntry::get_by_path(&db, "u1", "a.txt").unwrap().unwrap().id;
        FileEntry::apply_hashes(&db, &[(a_id, "deadbeef".to_string())]).unwrap();

        // Modify a.txt, create b/d.txt, delete b/c.txt
        fs::write(tree.path().join("a.txt"), b"012345678901234").unwrap();
        set_mtime(&tree.path().join("a.txt"), 150);
        fs::write(tree.path().join("b/d.txt"), b"0123456789012345678901234567890").unwrap();
        set_mtime(&tree.path().join("b/d.txt"), 250);
        fs::remove_file(tree.path().join("b/c.txt")).unwrap();

        let delta = scan(&db, &volume, ScanMode::Delta);
        assert_eq!(delta.inserted, 1);
        assert_eq!(delta.updated, 1);
        assert_eq!(delta.deleted, 1);

        let a = FileEntry::get_by_path(&db, "u1", "a.txt").unwrap().unwrap();
        assert_eq!(a.size, Some(15));
        assert_eq!(a.modified_at, Some(150));
        assert_eq!(a.fingerprint, None); // update cleared it

        assert!(FileEntry::get_by_path(&db, "u1", "b/d.txt").unwrap().is_some());
        assert!(FileEntry::get_by_path(&db, "u1", "b/c.txt").unwrap().is_none());

        // a.txt, b, b/d.txt
        assert_eq!(Drive::get(&db, "u1").unwrap().unwrap().file_count(), 3);
    }

    #[test]
    fn test_delta_on_unchanged_volume_is_noop() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"stable").unwrap();
        set_mtime(&tree.path().join("a.txt"), 1_000_000);

        let (db, volume, _guard) = setup(&tree);
        scan(&db, &volume, ScanMode::Full);

        let delta = scan(&db, &volume, ScanMode::Delta);
        assert_eq!(delta.inserted, 0);
        assert_eq!(delta.updated, 0);
        assert_eq!(delta.deleted, 0);
    }

    #[test]
    fn test_mtime_tolerance() {
        assert!(!mtime_differs(Some(100), Some(100)));
        assert!(!mtime_differs(Some(100), Some(101)));
        assert!(!mtime_differs(Some(101), Some(100)));
        assert!(mtime_differs(Some(100), Some(102)));
        assert!(mtime_differs(None, Some(100)));
        assert!(!mtime_differs(None, None));
    }

    #[test]
    fn test_full_scan_twice_is_idempotent() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"abc").unwrap();
        set_mtime(&tree.path().join("a.txt"), 5_000);
        fs::create_dir(tree.path().join("sub")).unwrap();
        fs::write(tree.path().join("sub/b.txt"), b"defg").unwrap();
        set_mtime(&tree.path().join("sub/b.txt"), 6_000);

        let (db, volume, _guard) = setup(&tree);
        scan(&db, &volume, ScanMode::Full);
        let first: Vec<(String, Option<i64>, bool)> = list_rows(&db);
        scan(&db, &volume, ScanMode::Full);
        let second: Vec<(String, Option<i64>, bool)> = list_rows(&db);

        assert_eq!(first, second);
    }

    #[test]
    fn test_delta_converges_to_full_scan_state() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"one").unwrap();
        set_mtime(&tree.path().join("a.txt"), 1_000);
        fs::create_dir(tree.path().join("d")).unwrap();
        fs::write(tree.path().join("d/b.txt"), b"two").unwrap();
        set_mtime(&tree.path().join("d/b.txt"), 2_000);

        let (db, volume, _guard) = setup(&tree);
        scan(&db, &volume, ScanMode::Full);

        // Mutate the tree, reconcile with a delta
        fs::write(tree.path().join("a.txt"), b"one bigger").unwrap();
        set_mtime(&tree.path().join("a.txt"), 3_000);
        fs::remove_file(tree.path().join("d/b.txt")).unwrap();
        fs::write(tree.path().join("d/c.txt"), b"three").unwrap();
        set_mtime(&tree.path().join("d/c.txt"), 4_000);
        scan(&db, &volume, ScanMode::Delta);
        let after_delta = list_rows(&db);

        // A full rescan of the same on-disk state lands on the same rows
        scan(&db, &volume, ScanMode::Full);
        assert_eq!(after_delta, list_rows(&db));
    }

    fn list_rows(db: &Database) -> Vec<(String, Option<i64>, bool)> {
        let reader = db.reader().unwrap();
        let mut stmt = reader
            .prepare(
                "SELECT relative_path, size, is_directory FROM files ORDER BY relative_path",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    #[test]
    fn test_cancel_commits_inflight_batch_and_skips_finish() {
        let tree = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(tree.path().join(format!("f{i}.txt")), b"x").unwrap();
        }

        let (db, volume, _guard) = setup(&tree);
        let reporter = ProgressReporter::silent("u1");
        let cancel = AtomicBool::new(true); // cancelled before the first boundary
        let outcome = Scanner::scan(
            &db,
            &volume,
            ScanMode::Full,
            &ScanFilters::defaults(),
            1, // every entry is a batch boundary
            &reporter,
            &cancel,
        )
        .unwrap();

        assert!(outcome.cancelled);
        // The boundary batch committed before the cancel was observed
        assert_eq!(FileEntry::count_for_drive(&db, "u1").unwrap(), 1);
        // A cancelled scan never stamps the drive
        assert_eq!(Drive::get(&db, "u1").unwrap().unwrap().last_scan_date(), None);
    }

    #[test]
    fn test_missing_root_aborts() {
        let tree = TempDir::new().unwrap();
        let (db, mut volume, _guard) = setup(&tree);
        volume.mount_path = tree.path().join("does-not-exist");

        let reporter = ProgressReporter::silent("u1");
        let cancel = AtomicBool::new(false);
        let result = Scanner::scan(
            &db,
            &volume,
            ScanMode::Full,
            &ScanFilters::defaults(),
            1000,
            &reporter,
            &cancel,
        );
        assert!(result.is_err());
    }
}
