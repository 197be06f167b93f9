//! SQLite storage for tenants, submitters, jobs and invoices.
//!
//! Every repo function goes through one shared [`Database`] handle. The
//! connection sits behind a mutex, so a closure passed to
//! [`Database::with_tx`] runs alone and commits atomically; job claiming and
//! export are built on that.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};

pub mod credential_repo;
pub mod error;
pub mod invoice_repo;
pub mod job_repo;
pub mod migrations;
pub mod tenant_repo;

pub use error::DatabaseError;

/// How long SQLite waits on a locked file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens `path`, creating parent directories and the file as needed,
    /// and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        // journal_mode answers with a row, so it cannot go through pragma_update.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let db = Self::prepare(conn)?;

        log::info!(
            "Opened store {} (schema v{})",
            path.display(),
            db.schema_version()?
        );
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    /// Runs `f` with exclusive use of the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. Commits when `f` returns `Ok`; any
    /// error rolls the whole closure back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Number of migrations applied to this store.
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        self.with_conn(migrations::current_version)
    }
}

/// `~/.contabot/data/contabot.db`, or `None` without a home directory.
pub fn default_database_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(home.join(".contabot").join("data").join("contabot.db"))
}

/// Storage format for every timestamp column: RFC 3339, UTC, microseconds.
///
/// Fixed width keeps string order equal to time order; claim ordering and
/// the retry gate compare these as text.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant_count(db: &Database) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM empresas", [], |r| r.get(0))?))
            .unwrap()
    }

    fn insert_tenant(conn: &Connection, fiscal: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO empresas (name, fiscal_id, fiscal_id_normalized, created_at)
             VALUES ('Colmado Luz', ?1, ?1, '2026-01-01T00:00:00.000000Z')",
            [fiscal],
        )
    }

    #[test]
    fn test_fresh_store_is_fully_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
        let foreign_keys: i64 = db
            .with_conn(|c| Ok(c.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("contabot.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|c| Ok(insert_tenant(c, "101000001")?)).unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        assert_eq!(tenant_count(&reopened), 1);
        assert_eq!(reopened.schema_version().unwrap(), migrations::latest_version());
    }

    #[test]
    fn test_failed_transaction_leaves_no_trace() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), DatabaseError> = db.with_tx(|tx| {
            insert_tenant(tx, "101000001")?;
            // Same fiscal id again violates the unique index.
            insert_tenant(tx, "101000001")?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(tenant_count(&db), 0);

        db.with_tx(|tx| Ok(insert_tenant(tx, "101000002")?)).unwrap();
        assert_eq!(tenant_count(&db), 1);
    }

    #[test]
    fn test_clones_share_one_connection() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();
        db.with_conn(|c| Ok(insert_tenant(c, "130123456")?)).unwrap();
        assert_eq!(tenant_count(&other), 1);
    }

    #[test]
    fn test_default_path_under_home() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with(".contabot/data/contabot.db"));
    }

    #[test]
    fn test_timestamp_text_order_matches_time_order() {
        let a = DateTime::from_timestamp(1_772_323_200, 1_000).unwrap();
        let b = DateTime::from_timestamp(1_772_323_200, 990_000_000).unwrap();
        let c = DateTime::from_timestamp(1_772_323_201, 0).unwrap();
        let texts: Vec<String> = [a, b, c].into_iter().map(format_timestamp).collect();

        assert!(texts[0] < texts[1] && texts[1] < texts[2]);
        assert!(texts.iter().all(|t| t.len() == texts[0].len() && t.ends_with('Z')));
    }
}
