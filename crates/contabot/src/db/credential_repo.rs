//! Per-tenant refresh tokens for the
//! cloud file store.

use rusqlite::{params, OptionalExtension};

use super::{now_timestamp, Database, DatabaseError};

/// A raw storage credential row.
///
/// `refresh_token` holds ciphertext when `encrypted` is set; decrypting is
/// the caller's concern (see [`crate::secrets::TokenEncryptor`]).
#[derive(Debug, Clone)]
pub struct StorageCredentialRow {
    pub tenant_id: i64,
    pub provider: String,
    pub refresh_token: String,
    pub encrypted: bool,
    pub folder_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Inserts or replaces the credentials of a tenant.
pub fn upsert(
    db: &Database,
    tenant_id: i64,
    provider: &str,
    refresh_token: &str,
    encrypted: bool,
    folder_id: Option<&str>,
) -> Result<(), DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO storage_credentials
               (tenant_id, provider, refresh_token, encrypted, folder_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(tenant_id) DO UPDATE SET
               provider = ?2,
               refresh_token = ?3,
               encrypted = ?4,
               folder_id = ?5,
               updated_at = ?6",
            params![tenant_id, provider, refresh_token, encrypted, folder_id, now],
        )?;
        Ok(())
    })
}

/// Finds the credentials of a tenant.
pub fn find(db: &Database, tenant_id: i64) -> Result<Option<StorageCredentialRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT tenant_id, provider, refresh_token, encrypted, folder_id, created_at, updated_at
                 FROM storage_credentials WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok(StorageCredentialRow {
                        tenant_id: row.get(0)?,
                        provider: row.get(1)?,
                        refresh_token: row.get(2)?,
                        encrypted: row.get(3)?,
                        folder_id: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?)
    })
}

/// Deletes the credentials of a tenant (e.g. after the grant was revoked).
pub fn delete(db: &Database, tenant_id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM storage_credentials WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(())
    })
}
