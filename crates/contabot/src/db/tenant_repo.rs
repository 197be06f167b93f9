//! Tenants (`empresas`) and the `submitters` bound to them.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_timestamp, Database, DatabaseError};
use crate::fiscal_id::FiscalId;

/// A company client managed by an accountant.
#[derive(Debug, Clone)]
pub struct TenantRow {
    pub id: i64,
    pub accountant_id: Option<i64>,
    pub name: String,
    pub fiscal_id: String,
    pub fiscal_id_normalized: String,
    pub created_at: String,
}

impl TenantRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            accountant_id: row.get("accountant_id")?,
            name: row.get("name")?,
            fiscal_id: row.get("fiscal_id")?,
            fiscal_id_normalized: row.get("fiscal_id_normalized")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A messaging identity that sends invoices.
#[derive(Debug, Clone)]
pub struct SubmitterRow {
    pub id: i64,
    pub external_id: String,
    pub chat_ref: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub tenant_id: Option<i64>,
    pub created_at: String,
    pub bound_at: Option<String>,
}

impl SubmitterRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            external_id: row.get("external_id")?,
            chat_ref: row.get("chat_ref")?,
            username: row.get("username")?,
            display_name: row.get("display_name")?,
            tenant_id: row.get("tenant_id")?,
            created_at: row.get("created_at")?,
            bound_at: row.get("bound_at")?,
        })
    }

    pub fn is_bound(&self) -> bool {
        self.tenant_id.is_some()
    }
}

/// Inserts a tenant and returns its id.
///
/// `fiscal_id_display` keeps the spelling the accountant entered; lookups use
/// the normalized form.
pub fn insert_tenant(
    db: &Database,
    accountant_id: Option<i64>,
    name: &str,
    fiscal_id_display: &str,
    fiscal_id: &FiscalId,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO empresas (accountant_id, name, fiscal_id, fiscal_id_normalized, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                accountant_id,
                name,
                fiscal_id_display,
                fiscal_id.as_str(),
                now_timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Finds a tenant by id.
pub fn find_tenant(db: &Database, id: i64) -> Result<Option<TenantRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM empresas WHERE id = ?1",
                params![id],
                TenantRow::from_row,
            )
            .optional()?)
    })
}

/// Finds a tenant by its normalized fiscal id.
pub fn find_tenant_by_fiscal_id(
    db: &Database,
    fiscal_id: &FiscalId,
) -> Result<Option<TenantRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM empresas WHERE fiscal_id_normalized = ?1",
                params![fiscal_id.as_str()],
                TenantRow::from_row,
            )
            .optional()?)
    })
}

/// Creates the submitter on first contact, or refreshes its chat and
/// profile fields. The tenant binding is never touched here.
pub fn upsert_submitter(
    db: &Database,
    external_id: &str,
    chat_ref: &str,
    username: Option<&str>,
    display_name: Option<&str>,
) -> Result<SubmitterRow, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO submitters (external_id, chat_ref, username, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(external_id) DO UPDATE SET
               chat_ref = ?2,
               username = COALESCE(?3, username),
               display_name = COALESCE(?4, display_name)",
            params![external_id, chat_ref, username, display_name, now_timestamp()],
        )?;
        Ok(conn.query_row(
            "SELECT * FROM submitters WHERE external_id = ?1",
            params![external_id],
            SubmitterRow::from_row,
        )?)
    })
}

/// Finds a submitter by id.
pub fn find_submitter(db: &Database, id: i64) -> Result<Option<SubmitterRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM submitters WHERE id = ?1",
                params![id],
                SubmitterRow::from_row,
            )
            .optional()?)
    })
}

/// Binds a submitter to a tenant. Returns false if the submitter does not exist.
pub fn bind_submitter(
    db: &Database,
    submitter_id: i64,
    tenant_id: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE submitters SET tenant_id = ?2, bound_at = ?3 WHERE id = ?1",
            params![submitter_id, tenant_id, now_timestamp()],
        )?;
        Ok(changed == 1)
    })
}
