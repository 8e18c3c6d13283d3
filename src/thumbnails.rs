use once_cell::sync::Lazy;
use rusqlite::Error::QueryReturnedNoRows;
use rusqlite::{params, Row};

use crate::database::Database;
use crate::error::DriveCatError;

/// Formats the default renderer can decode.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "ico", "qoi",
];

static MEDIA_NAME_CLAUSE: Lazy<String> = Lazy::new(|| {
    let likes: Vec<String> = MEDIA_EXTENSIONS
        .iter()
        .map(|ext| format!("f.name LIKE '%.{ext}'"))
        .collect();
    format!("({})", likes.join(" OR "))
});

/// A media file that still needs a thumbnail.
#[derive(Clone, Debug)]
pub struct ThumbnailCandidate {
    pub file_id: i64,
    pub drive_uuid: String,
    pub relative_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThumbnailRef {
    pub file_id: i64,
    pub path: String,
    pub size: i64,
    pub generated_at: i64,
}

impl ThumbnailRef {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ThumbnailRef {
            file_id: row.get(0)?,
            path: row.get(1)?,
            size: row.get(2)?,
            generated_at: row.get(3)?,
        })
    }

    pub fn get(db: &Database, file_id: i64) -> Result<Option<Self>, DriveCatError> {
        let reader = db.reader()?;
        match reader.query_row(
            "SELECT file_id, path, size, generated_at FROM thumbnails WHERE file_id = ?1",
            [file_id],
            Self::from_row,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DriveCatError::Database(e)),
        }
    }

    pub fn record(db: &Database, thumb: &ThumbnailRef) -> Result<(), DriveCatError> {
        db.with_writer(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO thumbnails (file_id, path, size, generated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![thumb.file_id, thumb.path, thumb.size, thumb.generated_at],
            )?;
            Ok(())
        })
    }

    pub fn delete(db: &Database, file_id: i64) -> Result<(), DriveCatError> {
        db.with_writer(|conn| {
            conn.execute("DELETE FROM thumbnails WHERE file_id = ?1", [file_id])?;
            Ok(())
        })
    }

    /// Eviction candidates, oldest first.
    pub fn oldest(db: &Database, limit: usize) -> Result<Vec<Self>, DriveCatError> {
        let reader = db.reader()?;
        let mut stmt = reader.prepare_cached(
            "SELECT file_id, path, size, generated_at FROM thumbnails
             ORDER BY generated_at ASC, file_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Bytes the thumbnail directory should be holding.
    pub fn total_bytes(db: &Database) -> Result<i64, DriveCatError> {
        let reader = db.reader()?;
        let total = reader.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM thumbnails",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Media rows with no thumbnail yet, in id order. `after_id` is the
    /// fill cursor so rows that failed to render are not handed out again
    /// in the same run.
    pub fn media_without_thumbnail(
        db: &Database,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ThumbnailCandidate>, DriveCatError> {
        let reader = db.reader()?;
        let sql = format!(
            "SELECT f.id, f.drive_uuid, f.relative_path FROM files f
             LEFT JOIN thumbnails t ON t.file_id = f.id
             WHERE t.file_id IS NULL AND f.is_directory = 0 AND f.id > ?2 AND {}
             ORDER BY f.id
             LIMIT ?1",
            *MEDIA_NAME_CLAUSE
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64, after_id], |row| {
                Ok(ThumbnailCandidate {
                    file_id: row.get(0)?,
                    drive_uuid: row.get(1)?,
                    relative_path: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn media_without_thumbnail_count(db: &Database) -> Result<i64, DriveCatError> {
        let reader = db.reader()?;
        let sql = format!(
            "SELECT count(*) FROM files f
             LEFT JOIN thumbnails t ON t.file_id = f.id
             WHERE t.file_id IS NULL AND f.is_directory = 0 AND {}",
            *MEDIA_NAME_CLAUSE
        );
        let count = reader.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }
}
