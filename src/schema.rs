pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Drives table tracks every volume ever seen, connected or not
CREATE TABLE IF NOT EXISTS drives (
    uuid TEXT PRIMARY KEY,             -- OS-reported stable volume identifier
    name TEXT NOT NULL,                -- Display name at last mount
    last_seen INTEGER,                 -- Unix seconds of the last mount observation
    total_capacity INTEGER,            -- Bytes
    used_capacity INTEGER,             -- Bytes
    last_scan_date INTEGER DEFAULT NULL, -- NULL until the first completed scan
    file_count INTEGER NOT NULL DEFAULT 0, -- Cached count, refreshed on scan completion
    excluded BOOLEAN NOT NULL DEFAULT 0
);

-- Files table is the inventory; one row per (drive, relative path)
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drive_uuid TEXT NOT NULL,
    name TEXT NOT NULL,                -- Leaf name
    relative_path TEXT NOT NULL,       -- Volume-root-relative, no leading separator
    size INTEGER,                      -- NULL for directories
    created_at INTEGER,                -- Unix seconds
    modified_at INTEGER,               -- Unix seconds
    is_directory BOOLEAN NOT NULL DEFAULT 0,
    fingerprint TEXT DEFAULT NULL,     -- Partial content hash; NULL until computed
    UNIQUE (drive_uuid, relative_path)
);

CREATE INDEX IF NOT EXISTS idx_files_drive ON files (drive_uuid);
CREATE INDEX IF NOT EXISTS idx_files_modified ON files (modified_at);
CREATE INDEX IF NOT EXISTS idx_files_name ON files (name);

-- Full-text index over file names and paths, kept in sync by triggers.
-- External-content: the FTS table reads row text from files and never
-- stores its own copy.
CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
    name,
    relative_path,
    content='files',
    content_rowid='id',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS files_fts_ai AFTER INSERT ON files BEGIN
    INSERT INTO files_fts(rowid, name, relative_path)
    VALUES (new.id, new.name, new.relative_path);
END;

CREATE TRIGGER IF NOT EXISTS files_fts_ad AFTER DELETE ON files BEGIN
    INSERT INTO files_fts(files_fts, rowid, name, relative_path)
    VALUES ('delete', old.id, old.name, old.relative_path);
END;

-- Row updates re-tokenize via delete + insert
CREATE TRIGGER IF NOT EXISTS files_fts_au AFTER UPDATE ON files BEGIN
    INSERT INTO files_fts(files_fts, rowid, name, relative_path)
    VALUES ('delete', old.id, old.name, old.relative_path);
    INSERT INTO files_fts(rowid, name, relative_path)
    VALUES (new.id, new.name, new.relative_path);
END;

CREATE TABLE IF NOT EXISTS thumbnails (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    path TEXT,                         -- Absolute path of the cached JPEG
    size INTEGER,                      -- Bytes on disk
    generated_at INTEGER               -- Unix seconds; eviction order
);

CREATE INDEX IF NOT EXISTS idx_thumbnails_generated ON thumbnails (generated_at);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT
);

COMMIT;
"#;
