use std::collections::HashSet;
use std::path::Path;

use rusqlite::OptionalExtension;

use crate::database::Database;
use crate::error::DriveCatError;

pub const KEY_EXCLUDED_DIRECTORIES: &str = "excluded_directories";
pub const KEY_EXCLUDED_EXTENSIONS: &str = "excluded_extensions";
pub const KEY_MIN_DUPLICATE_FILE_SIZE: &str = "min_duplicate_file_size";
pub const KEY_HASHING_ENABLED: &str = "hashing_enabled";
pub const KEY_THUMBNAILS_ENABLED: &str = "thumbnails_enabled";

/// Bookkeeping directories that never belong in the catalog.
pub const DEFAULT_EXCLUDED_DIRECTORIES: &[&str] = &[
    ".git",
    "node_modules",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".DocumentRevisions-V100",
    ".TemporaryItems",
];

pub const DEFAULT_EXCLUDED_EXTENSIONS: &[&str] = &[".tmp", ".cache", ".log", ".DS_Store"];

/// macOS-style bundles are recorded as single opaque entries.
pub const PACKAGE_EXTENSIONS: &[&str] = &[
    "app",
    "bundle",
    "framework",
    "photoslibrary",
    "fcpbundle",
    "imovielibrary",
];

pub fn get_setting(db: &Database, key: &str) -> Result<Option<String>, DriveCatError> {
    let reader = db.reader()?;
    let value = reader
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), DriveCatError> {
    db.with_writer(|conn| {
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    })
}

fn bool_setting(db: &Database, key: &str) -> Result<bool, DriveCatError> {
    Ok(get_setting(db, key)?
        .map(|v| v.trim() != "false")
        .unwrap_or(true))
}

pub fn hashing_enabled(db: &Database) -> Result<bool, DriveCatError> {
    bool_setting(db, KEY_HASHING_ENABLED)
}

pub fn thumbnails_enabled(db: &Database) -> Result<bool, DriveCatError> {
    bool_setting(db, KEY_THUMBNAILS_ENABLED)
}

/// Minimum size for duplicate fingerprinting; the config default applies
/// when no setting row exists or it fails to parse.
pub fn min_duplicate_file_size(db: &Database, default: u64) -> Result<u64, DriveCatError> {
    Ok(get_setting(db, KEY_MIN_DUPLICATE_FILE_SIZE)?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default))
}

/// Exclusion sets shared by the scanner and the change notifier. Read
/// through from the settings table on every load; never cached across
/// writes.
#[derive(Debug, Clone)]
pub struct ScanFilters {
    excluded_dirs: HashSet<String>,
    excluded_exts: HashSet<String>,
}

impl ScanFilters {
    pub fn load(db: &Database) -> Result<Self, DriveCatError> {
        let dirs = get_setting(db, KEY_EXCLUDED_DIRECTORIES)?;
        let exts = get_setting(db, KEY_EXCLUDED_EXTENSIONS)?;
        Ok(Self::from_lists(
            dirs.as_deref(),
            exts.as_deref(),
        ))
    }

    #[allow(dead_code)]
    pub fn defaults() -> Self {
        Self::from_lists(None, None)
    }

    fn from_lists(dirs: Option<&str>, exts: Option<&str>) -> Self {
        let excluded_dirs = match dirs {
            Some(csv) => csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_EXCLUDED_DIRECTORIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let excluded_exts = match exts {
            Some(csv) => csv
                .split(',')
                .map(normalize_suffix)
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|s| normalize_suffix(s))
                .collect(),
        };

        Self {
            excluded_dirs,
            excluded_exts,
        }
    }

    /// Directory names in this set are not descended into.
    pub fn is_excluded_dir(&self, name: &str) -> bool {
        self.excluded_dirs.contains(name)
    }

    /// A file is excluded when its extension matches a suffix in the set
    /// (with or without the leading dot) or its whole leaf name does.
    pub fn is_excluded_file(&self, name: &str) -> bool {
        if self.excluded_exts.contains(&normalize_suffix(name)) {
            return true;
        }
        Path::new(name)
            .extension()
            .map(|ext| {
                self.excluded_exts
                    .contains(&ext.to_string_lossy().to_lowercase())
            })
            .unwrap_or(false)
    }

    /// Filter for change-stream paths: drop anything under an excluded
    /// directory or with an excluded leaf.
    pub fn is_excluded_path(&self, path: &Path) -> bool {
        for component in path.components() {
            let part = component.as_os_str().to_string_lossy();
            if self.is_excluded_dir(&part) {
                return true;
            }
        }
        match path.file_name() {
            Some(leaf) => self.is_excluded_file(&leaf.to_string_lossy()),
            None => false,
        }
    }
}

/// Bundle directories are treated as opaque leaves.
pub fn is_package_dir(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            PACKAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn normalize_suffix(s: &str) -> String {
    s.trim().trim_start_matches('.').to_lowercase()
}
