use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn, Level};
use logging_timer::timer;
use threadpool::ThreadPool;

use crate::database::Database;
use crate::error::DriveCatError;
use crate::hasher::MountResolver;
use crate::settings;
use crate::thumbnails::ThumbnailRef;
use crate::utils::Utils;

const FILL_BATCH: usize = 100;
const EVICT_BATCH: usize = 100;
/// Evict down to this fraction of the budget, not just below it.
const EVICT_FLOOR: f64 = 0.8;
/// Decoded thumbnails held in memory.
const MEMORY_CACHE_BYTES: usize = 32 * 1024 * 1024;

/// Rendering is an external concern; the cache only needs encoded JPEG
/// bytes back.
pub trait ThumbnailRenderer: Send + Sync {
    fn render(&self, source: &Path, long_edge: u32) -> Result<Vec<u8>, DriveCatError>;
}

/// Default renderer backed by the image crate.
pub struct ImageRenderer;

impl ThumbnailRenderer for ImageRenderer {
    fn render(&self, source: &Path, long_edge: u32) -> Result<Vec<u8>, DriveCatError> {
        let decoded = image::ImageReader::open(source)?
            .with_guessed_format()?
            .decode()?;
        let thumb = decoded.thumbnail(long_edge, long_edge).to_rgb8();
        let mut bytes = Vec::new();
        thumb.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)?;
        Ok(bytes)
    }
}

/// Cheap in-process LRU over encoded thumbnails. Matched entries move to
/// the back; the front is evicted when the byte cost overflows.
struct MemoryCache {
    entries: Vec<(i64, Arc<Vec<u8>>)>,
    cost: usize,
    max_cost: usize,
}

impl MemoryCache {
    fn new(max_cost: usize) -> Self {
        Self {
            entries: Vec::new(),
            cost: 0,
            max_cost,
        }
    }

    fn get(&mut self, file_id: i64) -> Option<Arc<Vec<u8>>> {
        let pos = self.entries.iter().position(|(id, _)| *id == file_id)?;
        let entry = self.entries.remove(pos);
        let bytes = Arc::clone(&entry.1);
        self.entries.push(entry);
        Some(bytes)
    }

    fn insert(&mut self, file_id: i64, bytes: Arc<Vec<u8>>) {
        self.remove(file_id);
        self.cost += bytes.len();
        self.entries.push((file_id, bytes));
        while self.cost > self.max_cost && self.entries.len() > 1 {
            let (_, evicted) = self.entries.remove(0);
            self.cost -= evicted.len();
        }
    }

    fn remove(&mut self, file_id: i64) {
        if let Some(pos) = self.entries.iter().position(|(id, _)| *id == file_id) {
            let (_, removed) = self.entries.remove(pos);
            self.cost -= removed.len();
        }
    }
}

/// Disk-backed thumbnail cache with a byte budget. Thumbnails live under
/// `<root>/<id mod 100>/<id>.jpg`; two digits of sharding keep directory
/// fan-out bounded.
pub struct ThumbnailCache {
    db: Arc<Database>,
    root: PathBuf,
    budget: u64,
    long_edge: u32,
    threads: usize,
    renderer: Arc<dyn ThumbnailRenderer>,
    memory: Mutex<MemoryCache>,
    /// Render failures are not retried within the session.
    failed: Mutex<HashSet<i64>>,
    filling: AtomicBool,
}

impl ThumbnailCache {
    pub fn new(
        db: Arc<Database>,
        root: PathBuf,
        budget: u64,
        long_edge: u32,
        threads: usize,
        renderer: Arc<dyn ThumbnailRenderer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            root,
            budget,
            long_edge,
            threads: threads.max(1),
            renderer,
            memory: Mutex::new(MemoryCache::new(MEMORY_CACHE_BYTES)),
            failed: Mutex::new(HashSet::new()),
            filling: AtomicBool::new(false),
        })
    }

    pub fn thumbnail_path(&self, file_id: i64) -> PathBuf {
        self.root
            .join(format!("{:02}", file_id.rem_euclid(100)))
            .join(format!("{file_id}.jpg"))
    }

    /// Fetch the thumbnail for a file, producing and persisting it if
    /// needed. A `ThumbnailRef` whose disk file has gone missing is healed
    /// by dropping the ref and rendering fresh.
    pub fn get_or_create(
        &self,
        file_id: i64,
        source: &Path,
    ) -> Result<Arc<Vec<u8>>, DriveCatError> {
        if let Some(bytes) = self.memory.lock().unwrap().get(file_id) {
            return Ok(bytes);
        }

        if let Some(existing) = ThumbnailRef::get(&self.db, file_id)? {
            match fs::read(&existing.path) {
                Ok(bytes) => {
                    let bytes = Arc::new(bytes);
                    self.memory.lock().unwrap().insert(file_id, Arc::clone(&bytes));
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!(
                        "Healing dangling thumbnail ref for file {file_id}: {e}"
                    );
                    ThumbnailRef::delete(&self.db, file_id)?;
                }
            }
        }

        if self.failed.lock().unwrap().contains(&file_id) {
            return Err(DriveCatError::Error(format!(
                "Thumbnail for file {file_id} already failed this session"
            )));
        }

        let bytes = match self.renderer.render(source, self.long_edge) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                self.failed.lock().unwrap().insert(file_id);
                return Err(e);
            }
        };

        let path = self.thumbnail_path(file_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes.as_slice())?;

        ThumbnailRef::record(
            &self.db,
            &ThumbnailRef {
                file_id,
                path: path.to_string_lossy().into_owned(),
                size: bytes.len() as i64,
                generated_at: Utils::unix_now(),
            },
        )?;
        self.memory.lock().unwrap().insert(file_id, Arc::clone(&bytes));

        // Insert precedes eviction; overshoot is bounded by one thumbnail
        self.evict_if_needed()?;
        Ok(bytes)
    }

    /// Produce thumbnails for every indexed media file that lacks one.
    /// Idempotent; a second start while running is a no-op.
    pub fn fill_missing(
        self: &Arc<Self>,
        resolver: MountResolver,
        cancel: &AtomicBool,
    ) -> Result<u64, DriveCatError> {
        if self.filling.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let result = self.fill_inner(resolver, cancel);
        self.filling.store(false, Ordering::Release);
        result
    }

    fn fill_inner(
        self: &Arc<Self>,
        resolver: MountResolver,
        cancel: &AtomicBool,
    ) -> Result<u64, DriveCatError> {
        if !settings::thumbnails_enabled(&self.db)? {
            return Ok(0);
        }
        let _tmr = timer!(Level::Debug; "ThumbnailCache::fill_missing");

        let created = Arc::new(AtomicU64::new(0));
        let mut cursor: i64 = 0;

        loop {
            if cancel.load(Ordering::Acquire) {
                break;
            }

            let batch = ThumbnailRef::media_without_thumbnail(&self.db, cursor, FILL_BATCH)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.file_id;

            let pool = ThreadPool::new(self.threads);
            for candidate in batch {
                if self.failed.lock().unwrap().contains(&candidate.file_id) {
                    continue;
                }
                let Some(mount) = resolver(&candidate.drive_uuid) else {
                    continue;
                };
                let source = mount.join(&candidate.relative_path);
                let cache = Arc::clone(self);
                let created = Arc::clone(&created);
                pool.execute(move || {
                    match cache.get_or_create(candidate.file_id, &source) {
                        Ok(_) => {
                            created.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(
                                "Thumbnail failed for {}: {}",
                                candidate.relative_path, e
                            );
                        }
                    }
                });
            }
            pool.join();
        }

        let created = created.load(Ordering::Relaxed);
        if created > 0 {
            info!("Generated {created} thumbnail(s)");
        }
        Ok(created)
    }

    /// Enforce the byte budget: while usage exceeds it, drop the oldest
    /// thumbnails (disk file and ref together) until usage is back under
    /// 80% of the budget.
    pub fn evict_if_needed(&self) -> Result<u64, DriveCatError> {
        let mut total = ThumbnailRef::total_bytes(&self.db)?;
        if total <= self.budget as i64 {
            return Ok(0);
        }

        let floor = (self.budget as f64 * EVICT_FLOOR) as i64;
        let mut evicted: u64 = 0;

        while total > floor {
            let batch = ThumbnailRef::oldest(&self.db, EVICT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for thumb in batch {
                if total <= floor {
                    break;
                }
                if let Err(e) = fs::remove_file(&thumb.path) {
                    debug!("Evicting missing thumbnail file {}: {}", thumb.path, e);
                }
                ThumbnailRef::delete(&self.db, thumb.file_id)?;
                self.memory.lock().unwrap().remove(thumb.file_id);
                total -= thumb.size;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {evicted} thumbnail(s); cache now {total} bytes");
        }
        Ok(evicted)
    }
}
