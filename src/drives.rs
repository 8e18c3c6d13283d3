use rusqlite::Error::QueryReturnedNoRows;
use rusqlite::{params, Row};

use crate::database::Database;
use crate::error::DriveCatError;
use crate::volumes::MountedVolume;

/// A drive is remembered forever once seen; `last_scan_date` stays NULL
/// until its first completed scan, which is what selects full-scan mode.
#[derive(Clone, Debug)]
pub struct Drive {
    uuid: String,
    name: String,
    last_seen: Option<i64>,
    total_capacity: Option<i64>,
    used_capacity: Option<i64>,
    last_scan_date: Option<i64>,
    file_count: i64,
    excluded: bool,
}

impl Drive {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    pub fn total_capacity(&self) -> Option<i64> {
        self.total_capacity
    }

    pub fn used_capacity(&self) -> Option<i64> {
        self.used_capacity
    }

    pub fn last_scan_date(&self) -> Option<i64> {
        self.last_scan_date
    }

    pub fn file_count(&self) -> i64 {
        self.file_count
    }

    pub fn excluded(&self) -> bool {
        self.excluded
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Drive {
            uuid: row.get(0)?,
            name: row.get(1)?,
            last_seen: row.get(2)?,
            total_capacity: row.get(3)?,
            used_capacity: row.get(4)?,
            last_scan_date: row.get(5)?,
            file_count: row.get(6)?,
            excluded: row.get(7)?,
        })
    }

    const SELECT: &'static str = "SELECT uuid, name, last_seen, total_capacity, \
         used_capacity, last_scan_date, file_count, excluded FROM drives";

    /// Record a mount observation. Creates the drive on first sight,
    /// refreshes name, capacities, and last_seen on every subsequent one.
    pub fn upsert_mounted(
        db: &Database,
        volume: &MountedVolume,
        seen_at: i64,
    ) -> Result<(), DriveCatError> {
        db.with_writer(|conn| {
            conn.execute(
                "INSERT INTO drives (uuid, name, last_seen, total_capacity, used_capacity)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(uuid) DO UPDATE SET
                    name = excluded.name,
                    last_seen = excluded.last_seen,
                    total_capacity = excluded.total_capacity,
                    used_capacity = excluded.used_capacity",
                params![
                    volume.uuid,
                    volume.name,
                    seen_at,
                    volume.total_bytes as i64,
                    volume.used_bytes as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(db: &Database, uuid: &str) -> Result<Option<Self>, DriveCatError> {
        let reader = db.reader()?;
        let sql = format!("{} WHERE uuid = ?1", Self::SELECT);
        match reader.query_row(&sql, [uuid], Self::from_row) {
            Ok(drive) => Ok(Some(drive)),
            Err(QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DriveCatError::Database(e)),
        }
    }

    pub fn list(db: &Database) -> Result<Vec<Self>, DriveCatError> {
        let reader = db.reader()?;
        let sql = format!("{} ORDER BY name COLLATE NOCASE", Self::SELECT);
        let mut stmt = reader.prepare(&sql)?;
        let drives = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(drives)
    }

    /// Remove a drive and its whole inventory. Thumbnail rows cascade from
    /// the file deletes; the returned paths let the caller clean the
    /// thumbnail files off disk.
    pub fn remove(db: &Database, uuid: &str) -> Result<Vec<String>, DriveCatError> {
        db.immediate_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT t.path FROM thumbnails t
                 JOIN files f ON f.id = t.file_id
                 WHERE f.drive_uuid = ?1 AND t.path IS NOT NULL",
            )?;
            let thumb_paths = stmt
                .query_map([uuid], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            tx.execute("DELETE FROM files WHERE drive_uuid = ?1", [uuid])?;
            tx.execute("DELETE FROM drives WHERE uuid = ?1", [uuid])?;
            Ok(thumb_paths)
        })
    }

    pub fn set_excluded(db: &Database, uuid: &str, excluded: bool) -> Result<(), DriveCatError> {
        db.with_writer(|conn| {
            let updated = conn.execute(
                "UPDATE drives SET excluded = ?1 WHERE uuid = ?2",
                params![excluded, uuid],
            )?;
            if updated == 0 {
                return Err(DriveCatError::Error(format!("Drive '{uuid}' not found")));
            }
            Ok(())
        })
    }

    /// Stamp a completed scan: refresh the cached file count and the scan
    /// date in one statement.
    pub fn set_last_scan(
        db: &Database,
        uuid: &str,
        scanned_at: i64,
        file_count: i64,
    ) -> Result<(), DriveCatError> {
        db.with_writer(|conn| {
            let updated = conn.execute(
                "UPDATE drives SET last_scan_date = ?1, file_count = ?2 WHERE uuid = ?3",
                params![scanned_at, file_count, uuid],
            )?;
            if updated == 0 {
                return Err(DriveCatError::Error(format!("Drive '{uuid}' not found")));
            }
            Ok(())
        })
    }
}
