use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded};
use hex::encode;
use log::{info, warn, Level};
use logging_timer::timer;
use sha2::{Digest, Sha256};
use threadpool::ThreadPool;

use crate::database::Database;
use crate::error::DriveCatError;
use crate::files::{FileEntry, UnhashedFile};
use crate::settings;

/// Head and tail sample size per file.
pub const FINGERPRINT_CHUNK: u64 = 32 * 1024;

const BATCH_SIZE: usize = 1000;

/// Maps a drive uuid to its current mount path; None while disconnected.
pub type MountResolver = Arc<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Duplicate-detection fingerprint: SHA-256 over the first 32 KiB, the
/// decimal byte size, and the last 32 KiB. The two chunks overlap for
/// files smaller than 64 KiB; that is fine, the function stays stable.
pub fn partial_fingerprint(path: &Path, size: u64) -> Result<String, DriveCatError> {
    let mut file = File::open(path)?;

    let first = read_chunk(&mut file, 0)?;
    let last = read_chunk(&mut file, size.saturating_sub(FINGERPRINT_CHUNK))?;

    let mut hasher = Sha256::new();
    hasher.update(&first);
    hasher.update(size.to_string().as_bytes());
    hasher.update(&last);
    Ok(encode(hasher.finalize()))
}

fn read_chunk(file: &mut File, offset: u64) -> Result<Vec<u8>, DriveCatError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(FINGERPRINT_CHUNK as usize);
    file.by_ref()
        .take(FINGERPRINT_CHUNK)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Fills missing fingerprints in the background. Runs at most once at a
/// time; a start while a run is active is a no-op.
pub struct Hasher {
    db: Arc<Database>,
    threads: usize,
    min_file_size: u64,
    running: AtomicBool,
}

impl Hasher {
    pub fn new(db: Arc<Database>, threads: usize, min_file_size: u64) -> Arc<Self> {
        Arc::new(Self {
            db,
            threads: threads.max(1),
            min_file_size,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drain the unhashed working set in batches. Returns the number of
    /// fingerprints written. Per-file failures are skipped; the rest of
    /// the batch still commits.
    pub fn run(&self, resolver: MountResolver, cancel: &AtomicBool) -> Result<u64, DriveCatError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let result = self.run_inner(resolver, cancel);
        self.running.store(false, Ordering::Release);
        result
    }

    fn run_inner(
        &self,
        resolver: MountResolver,
        cancel: &AtomicBool,
    ) -> Result<u64, DriveCatError> {
        if !settings::hashing_enabled(&self.db)? {
            return Ok(0);
        }
        let _tmr = timer!(Level::Debug; "Hasher::run");
        let min_size = settings::min_duplicate_file_size(&self.db, self.min_file_size)?;

        let mut hashed: u64 = 0;
        let mut failures: u64 = 0;
        let mut cursor: i64 = 0;

        loop {
            if cancel.load(Ordering::Acquire) {
                break;
            }

            let batch = FileEntry::unhashed(&self.db, min_size, cursor, BATCH_SIZE)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id;

            let results = self.hash_batch(&batch, &resolver, &mut failures);
            hashed += results.len() as u64;
            FileEntry::apply_hashes(&self.db, &results)?;
        }

        if hashed > 0 || failures > 0 {
            info!("Fingerprinted {hashed} file(s), {failures} failure(s)");
        }
        Ok(hashed)
    }

    /// Bounded fan-out: a producer feeds a small channel that blocks when
    /// the workers lag, so at most `threads` reads are in flight.
    fn hash_batch(
        &self,
        batch: &[UnhashedFile],
        resolver: &MountResolver,
        failures: &mut u64,
    ) -> Vec<(i64, String)> {
        let pool = ThreadPool::new(self.threads);
        let (task_tx, task_rx) = bounded::<(i64, PathBuf, u64)>(self.threads * 2);
        let (result_tx, result_rx) = unbounded::<(i64, Result<String, DriveCatError>)>();

        for _ in 0..self.threads {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            pool.execute(move || {
                while let Ok((id, path, size)) = task_rx.recv() {
                    let result = partial_fingerprint(&path, size);
                    if result_tx.send((id, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        let mut submitted = 0usize;
        for file in batch {
            let Some(mount) = resolver(&file.drive_uuid) else {
                log_failure(failures, &file.relative_path, "volume not mounted");
                continue;
            };
            let path = mount.join(&file.relative_path);
            submitted += 1;
            if task_tx
                .send((file.id, path, file.size.max(0) as u64))
                .is_err()
            {
                break;
            }
        }
        drop(task_tx);
        pool.join();

        let mut results = Vec::with_capacity(submitted);
        while let Ok((id, result)) = result_rx.recv() {
            match result {
                Ok(fingerprint) => results.push((id, fingerprint)),
                Err(e) => log_failure(failures, &format!("file id {id}"), &e.to_string()),
            }
        }
        results
    }
}

/// Keep per-file noise down: the first few failures log at warn, the rest
/// only every hundredth.
fn log_failure(failures: &mut u64, what: &str, why: &str) {
    *failures += 1;
    if *failures <= 5 || *failures % 100 == 0 {
        warn!("Fingerprint skipped for {what}: {why} (failure #{failures})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::Drive;
    use crate::files::FileRecord;
    use crate::volumes::MountedVolume;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_fingerprint_depends_on_head_size_and_tail() {
        let dir = TempDir::new().unwrap();

        let a = write_file(dir.path(), "a.bin", b"hello world tail");
        let b = write_file(dir.path(), "b.bin", b"hello world tail");
        let fp_a = partial_fingerprint(&a, 16).unwrap();
        let fp_b = partial_fingerprint(&b, 16).unwrap();
        assert_eq!(fp_a, fp_b);
        assert_eq!(fp_a.len(), 64);
        assert!(fp_a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // Same bytes, different reported size
        let fp_sized = partial_fingerprint(&a, 15).unwrap();
        assert_ne!(fp_a, fp_sized);

        // Different content
        let c = write_file(dir.path(), "c.bin", b"hello world tall");
        assert_ne!(fp_a, partial_fingerprint(&c, 16).unwrap());
    }

    #[test]
    fn test_fingerprint_matches_definition_for_small_files() {
        let dir = TempDir::new().unwrap();
        let content = b"small file";
        let path = write_file(dir.path(), "s.bin", content);

        // Below the chunk size the head and tail are both the whole file
        let mut hasher = Sha256::new();
        hasher.update(content);
        hasher.update(content.len().to_string().as_bytes());
        hasher.update(content);
        let expected = encode(hasher.finalize());

        assert_eq!(
            partial_fingerprint(&path, content.len() as u64).unwrap(),
            expected
        );
    }

    #[test]
    fn test_fingerprint_samples_head_and_tail_of_large_files() {
        let dir = TempDir::new().unwrap();
        let chunk = FINGERPRINT_CHUNK as usize;

        // Two files with identical head and tail but different middles
        let mut one = vec![b'h'; chunk];
        one.extend(vec![b'x'; chunk]);
        one.extend(vec![b't'; chunk]);
        let mut two = vec![b'h'; chunk];
        two.extend(vec![b'y'; chunk]);
        two.extend(vec![b't'; chunk]);

        let p1 = write_file(dir.path(), "one.bin", &one);
        let p2 = write_file(dir.path(), "two.bin", &two);

        let size = one.len() as u64;
        assert_eq!(
            partial_fingerprint(&p1, size).unwrap(),
            partial_fingerprint(&p2, size).unwrap()
        );

        // Changing the tail changes the fingerprint
        let mut three = two.clone();
        *three.last_mut().unwrap() = b'T';
        let p3 = write_file(dir.path(), "three.bin", &three);
        assert_ne!(
            partial_fingerprint(&p2, size).unwrap(),
            partial_fingerprint(&p3, size).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_missing_file_errors() {
        assert!(partial_fingerprint(Path::new("/no/such/file"), 10).is_err());
    }

    fn seeded_db(tree: &Path, names: &[(&str, &[u8])]) -> (TempDir, Arc<Database>) {
        let db_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(db_dir.path()).unwrap());
        let volume = MountedVolume {
            uuid: "u1".to_string(),
            name: "Stick".to_string(),
            mount_path: tree.to_path_buf(),
            total_bytes: 0,
            used_bytes: 0,
        };
        Drive::upsert_mounted(&db, &volume, 1).unwrap();

        let records: Vec<FileRecord> = names
            .iter()
            .map(|(name, content)| {
                fs::write(tree.join(name), content).unwrap();
                FileRecord {
                    drive_uuid: "u1".to_string(),
                    name: name.to_string(),
                    relative_path: name.to_string(),
                    size: Some(content.len() as i64),
                    created_at: Some(1),
                    modified_at: Some(1),
                    is_directory: false,
                }
            })
            .collect();
        FileEntry::insert_batch(&db, &records).unwrap();
        (db_dir, db)
    }

    #[test]
    fn test_run_fills_fingerprints_and_skips_missing() {
        let tree = TempDir::new().unwrap();
        let (_db_guard, db) = seeded_db(
            tree.path(),
            &[("a.bin", b"aaaa"), ("b.bin", b"bbbb")],
        );
        // b.bin is indexed but gone from disk
        fs::remove_file(tree.path().join("b.bin")).unwrap();

        let hasher = Hasher::new(db.clone(), 2, 1);
        let mount = tree.path().to_path_buf();
        let resolver: MountResolver = Arc::new(move |_uuid| Some(mount.clone()));
        let cancel = AtomicBool::new(false);

        let hashed = hasher.run(resolver, &cancel).unwrap();
        assert_eq!(hashed, 1);

        let a = FileEntry::get_by_path(&db, "u1", "a.bin").unwrap().unwrap();
        assert!(a.fingerprint.is_some());
        let b = FileEntry::get_by_path(&db, "u1", "b.bin").unwrap().unwrap();
        assert!(b.fingerprint.is_none());
    }

    #[test]
    fn test_run_respects_disabled_setting() {
        let tree = TempDir::new().unwrap();
        let (_db_guard, db) = seeded_db(tree.path(), &[("a.bin", b"aaaa")]);
        settings::set_setting(&db, settings::KEY_HASHING_ENABLED, "false").unwrap();

        let hasher = Hasher::new(db.clone(), 2, 1);
        let mount = tree.path().to_path_buf();
        let resolver: MountResolver = Arc::new(move |_uuid| Some(mount.clone()));
        let cancel = AtomicBool::new(false);

        assert_eq!(hasher.run(resolver, &cancel).unwrap(), 0);
        let a = FileEntry::get_by_path(&db, "u1", "a.bin").unwrap().unwrap();
        assert!(a.fingerprint.is_none());
    }

    #[test]
    fn test_run_honors_size_floor() {
        let tree = TempDir::new().unwrap();
        let (_db_guard, db) = seeded_db(
            tree.path(),
            &[("small.bin", b"ss"), ("big.bin", b"bbbbbbbbbb")],
        );

        let hasher = Hasher::new(db.clone(), 2, 5);
        let mount = tree.path().to_path_buf();
        let resolver: MountResolver = Arc::new(move |_uuid| Some(mount.clone()));
        let cancel = AtomicBool::new(false);

        assert_eq!(hasher.run(resolver, &cancel).unwrap(), 1);
        let small = FileEntry::get_by_path(&db, "u1", "small.bin").unwrap().unwrap();
        assert!(small.fingerprint.is_none());
    }

    #[test]
    fn test_cancel_before_start_is_noop() {
        let tree = TempDir::new().unwrap();
        let (_db_guard, db) = seeded_db(tree.path(), &[("a.bin", b"aaaa")]);

        let hasher = Hasher::new(db.clone(), 2, 1);
        let mount = tree.path().to_path_buf();
        let resolver: MountResolver = Arc::new(move |_uuid| Some(mount.clone()));
        let cancel = AtomicBool::new(true);

        assert_eq!(hasher.run(resolver, &cancel).unwrap(), 0);
    }
}
