//! Schema upgrades.
//!
//! The schema version lives in SQLite's `user_version` header field and
//! equals the number of scripts applied. Each script runs in its own
//! transaction together with the version bump, so a crash mid-upgrade
//! resumes at the failed script.

use rusqlite::Connection;

use super::error::DatabaseError;

/// Upgrade scripts, oldest first. Append only: a script's position is its
/// version.
const SCRIPTS: &[(&str, &str)] = &[
    ("empresas", include_str!("sql/001_create_empresas.sql")),
    ("submitters", include_str!("sql/002_create_submitters.sql")),
    (
        "storage_credentials",
        include_str!("sql/003_create_storage_credentials.sql"),
    ),
    ("jobs", include_str!("sql/004_create_jobs.sql")),
    ("invoices", include_str!("sql/005_create_invoices.sql")),
    (
        "jobs.next_attempt_at",
        include_str!("sql/006_add_next_attempt_at.sql"),
    ),
    (
        "jobs.attachment_kind",
        include_str!("sql/007_add_attachment_kind.sql"),
    ),
];

pub fn latest_version() -> u32 {
    SCRIPTS.len() as u32
}

pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Applies every script newer than the stored version. Returns how many ran.
pub fn run_all(conn: &Connection) -> Result<usize, DatabaseError> {
    let from = current_version(conn)?;
    if from > latest_version() {
        return Err(DatabaseError::Migration {
            version: from,
            reason: format!(
                "store is at v{} but this build only knows v{}",
                from,
                latest_version()
            ),
        });
    }

    let pending = &SCRIPTS[from as usize..];
    for (offset, (label, sql)) in pending.iter().enumerate() {
        let version = from + offset as u32 + 1;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| DatabaseError::Migration {
                version,
                reason: format!("{}: {}", label, e),
            })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        log::info!("Schema upgraded to v{} ({})", version, label);
    }

    Ok(pending.len())
}
