use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::database::Database;
use crate::error::DriveCatError;
use crate::volumes::VolumeWatcher;

/// One search result row, joined with drive status.
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub file_id: i64,
    pub name: String,
    pub relative_path: String,
    pub size: Option<i64>,
    pub drive_uuid: String,
    pub drive_name: String,
    pub is_connected: bool,
    /// Entries across all drives sharing this (name, size) pair.
    pub duplicates: i64,
}

/// Prefix full-text search over file names, ranked by the index.
pub struct SearchService {
    db: Arc<Database>,
    volumes: Arc<VolumeWatcher>,
    limit: usize,
}

impl SearchService {
    pub fn new(db: Arc<Database>, volumes: Arc<VolumeWatcher>, limit: usize) -> Self {
        Self { db, volumes, limit }
    }

    pub fn search(&self, input: &str) -> Result<Vec<SearchHit>, DriveCatError> {
        // Empty and punctuation-only input never reaches the database
        let Some(expression) = build_match_expression(input) else {
            return Ok(Vec::new());
        };
        debug!("Search: {input:?} -> {expression:?}");

        let reader = self.db.reader()?;
        let mut stmt = reader.prepare_cached(
            "SELECT f.id, f.name, f.relative_path, f.size, f.drive_uuid, d.name,
                    (SELECT count(*) FROM files f2
                     WHERE f2.name = f.name AND f2.size IS f.size) AS duplicates
             FROM files_fts
             JOIN files f ON f.id = files_fts.rowid
             JOIN drives d ON d.uuid = f.drive_uuid
             WHERE files_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(
                rusqlite::params![expression, self.limit as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let hits = rows
            .into_iter()
            .map(
                |(file_id, name, relative_path, size, drive_uuid, drive_name, duplicates)| {
                    let is_connected = self.volumes.is_connected(&drive_uuid);
                    SearchHit {
                        file_id,
                        name,
                        relative_path,
                        size,
                        drive_uuid,
                        drive_name,
                        is_connected,
                        duplicates,
                    }
                },
            )
            .collect();
        Ok(hits)
    }
}

/// Turn free-form user text into a safe FTS5 match expression against the
/// name column: trim, double single quotes, strip grammar characters,
/// and append `*` for prefix matching. None means "answer with no results,
/// and do not touch the database".
pub fn build_match_expression(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let escaped = trimmed.replace('\'', "''");
    let cleaned: String = escaped
        .chars()
        .filter(|c| !matches!(c, '"' | ':' | '.'))
        .collect();
    let cleaned = cleaned.trim();

    // Without at least one token character the expression cannot match
    // anything, and bare punctuation is an FTS5 syntax error
    if !cleaned.chars().any(char::is_alphanumeric) {
        return None;
    }

    Some(format!("name: \"{cleaned}\"*"))
}
