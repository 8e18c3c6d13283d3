use crate::error::DriveCatError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

use log::{info, warn};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DB_FILENAME: &str = "drivecat.db";
const READ_POOL_SIZE: u32 = 4;

/// Write-ahead journaling keeps the read pool from blocking the writer.
const OPEN_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = 10000;
    PRAGMA temp_store = MEMORY;
";

/// Single-writer, multi-reader catalog store. All mutation goes through the
/// serialized write connection; queries run against a small pool of read
/// connections that see WAL snapshots.
pub struct Database {
    writer: Mutex<Connection>,
    readers: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    pub fn open(db_dir: &Path) -> Result<Self, DriveCatError> {
        fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join(DB_FILENAME);

        info!("Opening database: {}", db_path.display());
        let conn = Connection::open(&db_path)
            .map_err(|e| DriveCatError::StoreOpen(e.to_string()))?;
        conn.execute_batch(OPEN_PRAGMAS)
            .map_err(|e| DriveCatError::StoreOpen(e.to_string()))?;

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA query_only = ON;"));
        let readers = r2d2::Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)?;

        let db = Self {
            writer: Mutex::new(conn),
            readers,
            path: db_path,
        };

        db.ensure_schema()?;
        Ok(db)
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the write connection. Writes from all
    /// components funnel through here, one at a time.
    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DriveCatError>,
    ) -> Result<T, DriveCatError> {
        let conn = self.writer.lock().unwrap();
        f(&conn)
    }

    /// Run a closure inside a single immediate transaction. The batch either
    /// commits as a whole or rolls back as a whole.
    pub fn immediate_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, DriveCatError>,
    ) -> Result<T, DriveCatError> {
        let mut conn = self.writer.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>, DriveCatError> {
        Ok(self.readers.get()?)
    }

    fn ensure_schema(&self) -> Result<(), DriveCatError> {
        let conn = self.writer.lock().unwrap();

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            info!(
                "Database is uninitialized - creating schema at version {}",
                SCHEMA_VERSION
            );
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            info!("Database successfully initialized");
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(DriveCatError::Error(format!(
                "Schema version mismatch: found {other}, expected {SCHEMA_VERSION}"
            ))),
            None => Err(DriveCatError::Error("Schema version missing".to_string())),
        }
    }

    /// Opportunistic maintenance: merge FTS segments and refresh the query
    /// planner's statistics. Invoked after full scans and after enough
    /// accumulated delta churn.
    pub fn optimize(&self) -> Result<(), DriveCatError> {
        info!("Optimizing catalog database");
        let conn = self.writer.lock().unwrap();
        conn.execute("INSERT INTO files_fts(files_fts) VALUES ('optimize')", [])?;
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    /// Attempt repair after a corruption-class failure: rebuild the FTS
    /// shadow tables from the files table and reindex. Callers retry the
    /// failed operation once afterwards.
    pub fn recover(&self) -> Result<(), DriveCatError> {
        warn!("Attempting database recovery");
        let conn = self.writer.lock().unwrap();
        conn.execute("INSERT INTO files_fts(files_fts) VALUES ('rebuild')", [])?;
        conn.execute_batch("REINDEX;")?;

        let verdict: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(DriveCatError::Error(format!(
                "Integrity check failed after recovery: {verdict}"
            )));
        }
        info!("Database recovery completed");
        Ok(())
    }
}
