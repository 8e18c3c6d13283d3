use std::collections::HashMap;

use rusqlite::Error::QueryReturnedNoRows;
use rusqlite::{params, Row};

use crate::database::Database;
use crate::error::DriveCatError;

/// An entry observed on disk by the scanner, in insert shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub drive_uuid: String,
    pub name: String,
    pub relative_path: String,
    pub size: Option<i64>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// A metadata refresh for an existing row, keyed by id.
#[derive(Clone, Debug)]
pub struct FileUpdate {
    pub id: i64,
    pub name: String,
    pub size: Option<i64>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
}

/// What the delta scanner needs to know about a stored entry.
#[derive(Clone, Copy, Debug)]
pub struct ExistingEntry {
    pub id: i64,
    pub modified_at: Option<i64>,
}

/// A row awaiting its fingerprint.
#[derive(Clone, Debug)]
pub struct UnhashedFile {
    pub id: i64,
    pub drive_uuid: String,
    pub relative_path: String,
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub id: i64,
    pub drive_uuid: String,
    pub name: String,
    pub relative_path: String,
    pub size: Option<i64>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
    pub fingerprint: Option<String>,
}

impl FileEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(FileEntry {
            id: row.get(0)?,
            drive_uuid: row.get(1)?,
            name: row.get(2)?,
            relative_path: row.get(3)?,
            size: row.get(4)?,
            created_at: row.get(5)?,
            modified_at: row.get(6)?,
            is_directory: row.get(7)?,
            fingerprint: row.get(8)?,
        })
    }

    const SELECT: &'static str = "SELECT id, drive_uuid, name, relative_path, size, \
         created_at, modified_at, is_directory, fingerprint FROM files";

    /// Atomic upsert of a scanner batch. The whole batch commits or rolls
    /// back together. An upsert that changes size or modification time
    /// invalidates the stored fingerprint; FTS rows follow via triggers.
    pub fn insert_batch(db: &Database, batch: &[FileRecord]) -> Result<(), DriveCatError> {
        if batch.is_empty() {
            return Ok(());
        }
        db.immediate_transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO files
                    (drive_uuid, name, relative_path, size, created_at, modified_at, is_directory)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(drive_uuid, relative_path) DO UPDATE SET
                    name = excluded.name,
                    created_at = excluded.created_at,
                    is_directory = excluded.is_directory,
                    fingerprint = CASE
                        WHEN files.size IS NOT excluded.size
                          OR files.modified_at IS NOT excluded.modified_at
                        THEN NULL ELSE files.fingerprint END,
                    size = excluded.size,
                    modified_at = excluded.modified_at",
            )?;
            for record in batch {
                stmt.execute(params![
                    record.drive_uuid,
                    record.name,
                    record.relative_path,
                    record.size,
                    record.created_at,
                    record.modified_at,
                    record.is_directory,
                ])?;
            }
            Ok(())
        })
    }

    /// Atomic metadata update by id. A size or modification-time change
    /// clears the fingerprint.
    pub fn update_batch(db: &Database, batch: &[FileUpdate]) -> Result<(), DriveCatError> {
        if batch.is_empty() {
            return Ok(());
        }
        db.immediate_transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "UPDATE files SET
                    name = ?2,
                    fingerprint = CASE
                        WHEN size IS NOT ?3 OR modified_at IS NOT ?5
                        THEN NULL ELSE fingerprint END,
                    size = ?3,
                    created_at = ?4,
                    modified_at = ?5
                 WHERE id = ?1",
            )?;
            for update in batch {
                stmt.execute(params![
                    update.id,
                    update.name,
                    update.size,
                    update.created_at,
                    update.modified_at,
                ])?;
            }
            Ok(())
        })
    }

    /// Batch delete by relative path. Thumbnail rows cascade; the returned
    /// paths are the on-disk thumbnails orphaned by the delete.
    pub fn delete_batch(
        db: &Database,
        drive_uuid: &str,
        paths: &[String],
    ) -> Result<Vec<String>, DriveCatError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        db.immediate_transaction(|tx| {
            let mut thumb_paths = Vec::new();
            {
                let mut select = tx.prepare_cached(
                    "SELECT t.path FROM thumbnails t
                     JOIN files f ON f.id = t.file_id
                     WHERE f.drive_uuid = ?1 AND f.relative_path = ?2 AND t.path IS NOT NULL",
                )?;
                let mut delete = tx.prepare_cached(
                    "DELETE FROM files WHERE drive_uuid = ?1 AND relative_path = ?2",
                )?;
                for path in paths {
                    let orphaned = select
                        .query_map(params![drive_uuid, path], |row| row.get::<_, String>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    thumb_paths.extend(orphaned);
                    delete.execute(params![drive_uuid, path])?;
                }
            }
            Ok(thumb_paths)
        })
    }

    /// Drop a drive's entire inventory (full-rescan preamble). Returns the
    /// orphaned thumbnail disk paths.
    pub fn clear_drive(db: &Database, drive_uuid: &str) -> Result<Vec<String>, DriveCatError> {
        db.immediate_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT t.path FROM thumbnails t
                 JOIN files f ON f.id = t.file_id
                 WHERE f.drive_uuid = ?1 AND t.path IS NOT NULL",
            )?;
            let thumb_paths = stmt
                .query_map([drive_uuid], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            tx.execute("DELETE FROM files WHERE drive_uuid = ?1", [drive_uuid])?;
            Ok(thumb_paths)
        })
    }

    /// The stored inventory as a path-indexed map, for delta reconciliation.
    /// Holding every path of one volume in memory is acceptable; the scanner
    /// is the only caller.
    pub fn existing_for_drive(
        db: &Database,
        drive_uuid: &str,
    ) -> Result<HashMap<String, ExistingEntry>, DriveCatError> {
        let reader = db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT relative_path, id, modified_at FROM files WHERE drive_uuid = ?1",
        )?;
        let mut map = HashMap::new();
        let rows = stmt.query_map([drive_uuid], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ExistingEntry {
                    id: row.get(1)?,
                    modified_at: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (path, entry) = row?;
            map.insert(path, entry);
        }
        Ok(map)
    }

    pub fn count_for_drive(db: &Database, drive_uuid: &str) -> Result<i64, DriveCatError> {
        let reader = db.reader()?;
        let count = reader.query_row(
            "SELECT count(*) FROM files WHERE drive_uuid = ?1",
            [drive_uuid],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    #[allow(dead_code)]
    pub fn get_by_path(
        db: &Database,
        drive_uuid: &str,
        relative_path: &str,
    ) -> Result<Option<Self>, DriveCatError> {
        let reader = db.reader()?;
        let sql = format!("{} WHERE drive_uuid = ?1 AND relative_path = ?2", Self::SELECT);
        match reader.query_row(&sql, params![drive_uuid, relative_path], Self::from_row) {
            Ok(entry) => Ok(Some(entry)),
            Err(QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DriveCatError::Database(e)),
        }
    }

    /// Files at or above the size floor that still need a fingerprint, in
    /// id order. `after_id` is the drain cursor: batches the caller already
    /// attempted (including failures) are never handed out again.
    pub fn unhashed(
        db: &Database,
        min_size: u64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<UnhashedFile>, DriveCatError> {
        let reader = db.reader()?;
        let mut stmt = reader.prepare_cached(
            "SELECT id, drive_uuid, relative_path, size FROM files
             WHERE is_directory = 0 AND fingerprint IS NULL AND size >= ?1 AND id > ?3
             ORDER BY id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![min_size as i64, limit as i64, after_id], |row| {
                Ok(UnhashedFile {
                    id: row.get(0)?,
                    drive_uuid: row.get(1)?,
                    relative_path: row.get(2)?,
                    size: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn unhashed_count(db: &Database, min_size: u64) -> Result<i64, DriveCatError> {
        let reader = db.reader()?;
        let count = reader.query_row(
            "SELECT count(*) FROM files
             WHERE is_directory = 0 AND fingerprint IS NULL AND size >= ?1",
            [min_size as i64],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Apply one hasher batch atomically. Rows either get their computed
    /// fingerprint or keep none; there is no partial state.
    pub fn apply_hashes(db: &Database, batch: &[(i64, String)]) -> Result<(), DriveCatError> {
        if batch.is_empty() {
            return Ok(());
        }
        db.immediate_transaction(|tx| {
            let mut stmt =
                tx.prepare_cached("UPDATE files SET fingerprint = ?2 WHERE id = ?1")?;
            for (id, fingerprint) in batch {
                stmt.execute(params![id, fingerprint])?;
            }
            Ok(())
        })
    }
}
