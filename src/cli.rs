use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::alerts::LogNotifier;
use crate::config::{self, Config};
use crate::database::Database;
use crate::drives::Drive;
use crate::error::DriveCatError;
use crate::hasher::{Hasher, MountResolver};
use crate::orchestrator;
use crate::progress::ProgressReporter;
use crate::scanner::{ScanMode, Scanner};
use crate::search::SearchService;
use crate::settings::ScanFilters;
use crate::thumb_cache::{ImageRenderer, ThumbnailCache};
use crate::thumbnails::ThumbnailRef;
use crate::utils::Utils;
use crate::volumes::{MountedVolume, SystemVolumes, VolumeWatcher};

/// CLI for drivecat: catalog and search removable drives.
#[derive(Parser)]
#[command(
    name = "drivecat",
    version,
    about = "Removable-drive indexing and search"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(about = "Run the indexing service until interrupted",
        long_about = "Watches for drives being attached and detached, keeps their \
inventories reconciled, and maintains fingerprints and thumbnails in the \
background. This is the normal long-running mode.")]
    Watch,

    #[command(about = "Scan one mounted drive now")]
    Scan {
        #[arg(long, conflicts_with = "mount", help = "Drive by stable volume UUID")]
        uuid: Option<String>,

        #[arg(long, help = "Drive by current mount path")]
        mount: Option<PathBuf>,

        #[arg(long, help = "Force a full rescan even if the drive was scanned before")]
        full: bool,
    },

    #[command(about = "Search the catalog by file name prefix")]
    Search {
        query: String,

        #[arg(long, help = "Maximum number of results")]
        limit: Option<usize>,
    },

    #[command(about = "List and manage known drives")]
    Drives {
        #[command(subcommand)]
        action: DriveCommand,
    },

    #[command(about = "Fingerprint files that do not have one yet")]
    Hash,

    #[command(about = "Maintain the thumbnail cache")]
    Thumbs {
        #[command(subcommand)]
        action: ThumbCommand,
    },
}

#[derive(Subcommand)]
pub enum DriveCommand {
    #[command(about = "List every drive the catalog knows about")]
    List,
    #[command(about = "Forget a drive and delete its indexed inventory")]
    Remove { uuid: String },
    #[command(about = "Stop indexing a drive (its data is kept)")]
    Exclude { uuid: String },
    #[command(about = "Resume indexing a previously excluded drive")]
    Include { uuid: String },
}

#[derive(Subcommand)]
pub enum ThumbCommand {
    #[command(about = "Generate thumbnails for indexed media without one")]
    Fill,
    #[command(about = "Enforce the thumbnail byte budget now")]
    Evict,
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs) -> Result<(), DriveCatError> {
        let cli = Cli::parse();
        let config = config::get();
        let data_dir = Config::data_dir(project_dirs);
        let db = Arc::new(Database::open(&data_dir)?);
        let thumbs_root = data_dir.join("thumbnails");

        match cli.command {
            Command::Watch => run_watch(db, thumbs_root, config),
            Command::Scan { uuid, mount, full } => run_scan(&db, uuid, mount, full, config),
            Command::Search { query, limit } => run_search(db, &query, limit, config),
            Command::Drives { action } => run_drives(&db, action),
            Command::Hash => run_hash(db, config),
            Command::Thumbs { action } => run_thumbs(db, thumbs_root, action, config),
        }
    }
}

fn run_watch(
    db: Arc<Database>,
    thumbs_root: PathBuf,
    config: &Config,
) -> Result<(), DriveCatError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(orchestrator::run_service(
        db,
        thumbs_root,
        Arc::new(LogNotifier),
        config,
    ))
}

/// Resolve the target volume from the current mount table.
fn find_target(
    volumes: &VolumeWatcher,
    uuid: Option<String>,
    mount: Option<PathBuf>,
) -> Result<MountedVolume, DriveCatError> {
    match (uuid, mount) {
        (Some(uuid), _) => volumes
            .get(&uuid)
            .ok_or_else(|| DriveCatError::Error(format!("Drive '{uuid}' is not mounted"))),
        (None, Some(mount)) => {
            let canonical = dunce::canonicalize(&mount)?;
            volumes
                .mounted()
                .into_iter()
                .find(|v| v.mount_path == canonical)
                .ok_or_else(|| {
                    DriveCatError::Error(format!(
                        "No indexable volume mounted at '{}'",
                        canonical.display()
                    ))
                })
        }
        (None, None) => Err(DriveCatError::Error(
            "Specify --uuid or --mount".to_string(),
        )),
    }
}

fn run_scan(
    db: &Arc<Database>,
    uuid: Option<String>,
    mount: Option<PathBuf>,
    full: bool,
    config: &Config,
) -> Result<(), DriveCatError> {
    let volumes = VolumeWatcher::new(Arc::new(SystemVolumes));
    volumes.poll();
    let volume = find_target(&volumes, uuid, mount)?;

    Drive::upsert_mounted(db, &volume, Utils::unix_now())?;
    let drive = Drive::get(db, &volume.uuid)?;
    let mode = if full || drive.and_then(|d| d.last_scan_date()).is_none() {
        ScanMode::Full
    } else {
        ScanMode::Delta
    };

    println!("Scanning {} ({} scan)...", volume.name, mode);
    let filters = ScanFilters::load(db)?;
    let reporter = ProgressReporter::silent(&volume.uuid);
    let cancel = AtomicBool::new(false);
    let outcome = Scanner::scan(
        db,
        &volume,
        mode,
        &filters,
        config.scanner.batch_size,
        &reporter,
        &cancel,
    )?;

    println!("{:<12} {}", "Entries:", outcome.entries_seen);
    println!("{:<12} {}", "Added:", outcome.inserted);
    println!("{:<12} {}", "Modified:", outcome.updated);
    println!("{:<12} {}", "Deleted:", outcome.deleted);
    println!("{:<12} {}", "Indexed:", outcome.file_count);

    // One-shot scans run the follow-up passes inline
    let resolver = mount_resolver(&volumes);
    let hasher = Hasher::new(
        Arc::clone(db),
        config.hasher.threads,
        config.hasher.min_file_size,
    );
    let hashed = hasher.run(Arc::clone(&resolver), &cancel)?;
    if hashed > 0 {
        println!("{:<12} {}", "Hashed:", hashed);
    }
    Ok(())
}

fn run_search(
    db: Arc<Database>,
    query: &str,
    limit: Option<usize>,
    config: &Config,
) -> Result<(), DriveCatError> {
    let volumes = VolumeWatcher::new(Arc::new(SystemVolumes));
    volumes.poll();

    let service = SearchService::new(db, volumes, limit.unwrap_or(config.search.limit));
    let hits = service.search(query)?;
    if hits.is_empty() {
        println!("No matches");
        return Ok(());
    }

    for hit in hits {
        let marker = if hit.is_connected { "*" } else { " " };
        let dupes = if hit.duplicates > 1 {
            format!("  ({} copies)", hit.duplicates)
        } else {
            String::new()
        };
        println!(
            "{marker} {:<40} {:>12}  {} / {}{dupes}",
            hit.name,
            hit.size.map(format_size).unwrap_or_default(),
            hit.drive_name,
            hit.relative_path,
        );
    }
    Ok(())
}

fn run_drives(db: &Arc<Database>, action: DriveCommand) -> Result<(), DriveCatError> {
    match action {
        DriveCommand::List => {
            for drive in Drive::list(db)? {
                let capacity = match (drive.used_capacity(), drive.total_capacity()) {
                    (Some(used), Some(total)) => {
                        format!("{} / {}", format_size(used), format_size(total))
                    }
                    _ => "unknown".to_string(),
                };
                println!(
                    "{}  {:<24} {:>8} files  {capacity:<22} last seen {}  last scan {}{}",
                    drive.uuid(),
                    drive.name(),
                    drive.file_count(),
                    format_time(drive.last_seen()),
                    format_time(drive.last_scan_date()),
                    if drive.excluded() { "  [excluded]" } else { "" },
                );
            }
        }
        DriveCommand::Remove { uuid } => {
            let thumb_paths = Drive::remove(db, &uuid)?;
            for path in &thumb_paths {
                let _ = std::fs::remove_file(path);
            }
            println!("Removed {uuid} ({} thumbnails cleaned)", thumb_paths.len());
        }
        DriveCommand::Exclude { uuid } => {
            Drive::set_excluded(db, &uuid, true)?;
            println!("Excluded {uuid}");
        }
        DriveCommand::Include { uuid } => {
            Drive::set_excluded(db, &uuid, false)?;
            println!("Included {uuid}");
        }
    }
    Ok(())
}

fn run_hash(db: Arc<Database>, config: &Config) -> Result<(), DriveCatError> {
    let volumes = VolumeWatcher::new(Arc::new(SystemVolumes));
    volumes.poll();

    let hasher = Hasher::new(
        Arc::clone(&db),
        config.hasher.threads,
        config.hasher.min_file_size,
    );
    let cancel = AtomicBool::new(false);
    let hashed = hasher.run(mount_resolver(&volumes), &cancel)?;

    let remaining =
        crate::files::FileEntry::unhashed_count(&db, config.hasher.min_file_size)?;
    println!("Fingerprinted {hashed} file(s); {remaining} still pending");
    Ok(())
}

fn run_thumbs(
    db: Arc<Database>,
    thumbs_root: PathBuf,
    action: ThumbCommand,
    config: &Config,
) -> Result<(), DriveCatError> {
    let cache = ThumbnailCache::new(
        db.clone(),
        thumbs_root,
        config.thumbnails.budget_bytes,
        config.thumbnails.long_edge,
        config.thumbnails.threads,
        Arc::new(ImageRenderer),
    );

    match action {
        ThumbCommand::Fill => {
            let volumes = VolumeWatcher::new(Arc::new(SystemVolumes));
            volumes.poll();
            let cancel = AtomicBool::new(false);
            let created = cache.fill_missing(mount_resolver(&volumes), &cancel)?;
            let pending = ThumbnailRef::media_without_thumbnail_count(&db)?;
            println!("Generated {created} thumbnail(s); {pending} still pending");
        }
        ThumbCommand::Evict => {
            let evicted = cache.evict_if_needed()?;
            let bytes = ThumbnailRef::total_bytes(&db)?;
            println!("Evicted {evicted} thumbnail(s); cache holds {} now", format_size(bytes));
        }
    }
    Ok(())
}

fn mount_resolver(volumes: &Arc<VolumeWatcher>) -> MountResolver {
    let volumes = Arc::clone(volumes);
    Arc::new(move |uuid: &str| volumes.resolve(uuid))
}

fn format_time(unix: Option<i64>) -> String {
    match unix.and_then(|t| DateTime::from_timestamp(t, 0)) {
        Some(time) => time.format("%Y-%m-%d %H:%M").to_string(),
        None => "never".to_string(),
    }
}

fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes.max(0), UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// Watch-mode startup is logged so service managers have a breadcrumb
pub fn log_startup(config: &Config) {
    info!(
        "drivecat configured: debounce {}s, hash threads {}, thumb budget {} bytes",
        config.watcher.debounce_secs, config.hasher.threads, config.thumbnails.budget_bytes
    );
}
