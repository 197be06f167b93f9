use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store's directory could not be created.
    #[error("cannot prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema upgrade to v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A row written in this process could not be read back.
    #[error("{table} row {id} disappeared")]
    MissingRow { table: &'static str, id: i64 },

    #[error("database lock poisoned by a panicked thread")]
    LockPoisoned,
}
