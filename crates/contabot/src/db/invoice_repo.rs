//! CRUD and review-state transitions for `invoices`.

use rusqlite::{params, OptionalExtension};

use super::{now_timestamp, Database, DatabaseError};
use crate::invoice::{Invoice, InvoiceUpdate, NewInvoice, ReviewState};

/// Query filter parameters for invoice listing.
#[derive(Debug, Default, Clone)]
pub struct InvoiceFilter {
    pub tenant_id: Option<i64>,
    /// Empty means any state.
    pub states: Vec<ReviewState>,
    /// `None` returns every match.
    pub limit: Option<u64>,
}

/// Inserts the invoice of a job. A job produces at most one invoice: when a
/// re-run finds one already stored, the existing id is returned with
/// `created == false`.
pub fn insert_for_job(db: &Database, invoice: &NewInvoice) -> Result<(i64, bool), DatabaseError> {
    let now = now_timestamp();
    let f = &invoice.fields;
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT INTO invoices (tenant_id, submitter_id, job_id, invoice_date, fiscal_id,
             document_number, vendor_name, amount_goods, amount_services, itbis, selective_tax,
             other_taxes, tip, total, payment_method, expense_category, id_type, confidence_score,
             review_state, storage_url, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, 'pending', ?19, ?20, ?21, ?21)
             ON CONFLICT(job_id) DO NOTHING",
            params![
                invoice.tenant_id,
                invoice.submitter_id,
                invoice.job_id,
                f.date,
                f.fiscal_id,
                f.document_number,
                f.vendor_name,
                f.amounts.goods,
                f.amounts.services,
                f.amounts.itbis,
                f.amounts.selective_tax,
                f.amounts.other_taxes,
                f.amounts.tip,
                f.amounts.total,
                f.payment_method,
                f.expense_category,
                f.id_type,
                invoice.confidence_score,
                invoice.storage_url,
                invoice.notes,
                now,
            ],
        )?;
        if inserted == 1 {
            return Ok((conn.last_insert_rowid(), true));
        }
        let id: i64 = conn.query_row(
            "SELECT id FROM invoices WHERE job_id = ?1",
            params![invoice.job_id],
            |r| r.get(0),
        )?;
        Ok((id, false))
    })
}

/// Finds an invoice by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<Invoice>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM invoices WHERE id = ?1", params![id], Invoice::from_row)
            .optional()?)
    })
}

/// Finds the invoice created for a job.
pub fn find_by_job_id(db: &Database, job_id: i64) -> Result<Option<Invoice>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM invoices WHERE job_id = ?1",
                params![job_id],
                Invoice::from_row,
            )
            .optional()?)
    })
}

/// Lists invoices oldest first.
pub fn list(db: &Database, filter: &InvoiceFilter) -> Result<Vec<Invoice>, DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(tenant_id) = filter.tenant_id {
            conditions.push(format!("tenant_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(tenant_id));
        }
        if !filter.states.is_empty() {
            let placeholders: Vec<String> = filter
                .states
                .iter()
                .map(|state| {
                    param_values.push(Box::new(*state));
                    format!("?{}", param_values.len())
                })
                .collect();
            conditions.push(format!("review_state IN ({})", placeholders.join(", ")));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let mut sql = format!(
            "SELECT * FROM invoices {} ORDER BY created_at ASC, id ASC",
            where_clause
        );
        if let Some(limit) = filter.limit {
            param_values.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", param_values.len()));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), Invoice::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves an invoice to `to` if its current state is one of `from`.
/// Returns false (and changes nothing) otherwise.
pub fn transition(
    db: &Database,
    id: i64,
    from: &[ReviewState],
    to: ReviewState,
) -> Result<bool, DatabaseError> {
    if from.is_empty() {
        return Ok(false);
    }
    let now = now_timestamp();
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "UPDATE invoices SET review_state = ?2, updated_at = ?3, reviewed_at = ?3
             WHERE id = ?1 AND review_state IN ({})",
            placeholders.join(", ")
        );
        let mut values: Vec<&dyn rusqlite::types::ToSql> = vec![&id, &to, &now];
        for state in from {
            values.push(state);
        }
        Ok(conn.execute(&sql, values.as_slice())? == 1)
    })
}

/// Applies reviewer corrections to an editable (pending or ready) invoice.
/// Returns false if the invoice is missing or no longer editable.
pub fn update_fields(db: &Database, id: i64, update: &InvoiceUpdate) -> Result<bool, DatabaseError> {
    if update.is_empty() {
        return Ok(find_by_id(db, id)?.is_some_and(|inv| inv.review_state.is_editable()));
    }

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(id)];

    macro_rules! set_if_some {
        ($field:expr, $column:literal) => {
            if let Some(value) = &$field {
                values.push(Box::new(value.clone()));
                sets.push(format!("{} = ?{}", $column, values.len()));
            }
        };
    }

    set_if_some!(update.date, "invoice_date");
    set_if_some!(update.fiscal_id, "fiscal_id");
    set_if_some!(update.document_number, "document_number");
    set_if_some!(update.vendor_name, "vendor_name");
    set_if_some!(update.amount_goods, "amount_goods");
    set_if_some!(update.amount_services, "amount_services");
    set_if_some!(update.itbis, "itbis");
    set_if_some!(update.selective_tax, "selective_tax");
    set_if_some!(update.other_taxes, "other_taxes");
    set_if_some!(update.tip, "tip");
    set_if_some!(update.total, "total");
    set_if_some!(update.payment_method, "payment_method");
    set_if_some!(update.expense_category, "expense_category");
    set_if_some!(update.id_type, "id_type");
    set_if_some!(update.notes, "notes");

    values.push(Box::new(now_timestamp()));
    sets.push(format!("updated_at = ?{}", values.len()));

    let sql = format!(
        "UPDATE invoices SET {} WHERE id = ?1 AND review_state IN ('pending', 'ready')",
        sets.join(", ")
    );

    db.with_conn(|conn| {
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|p| p.as_ref()).collect();
        Ok(conn.execute(&sql, params_ref.as_slice())? == 1)
    })
}

/// Moves every approved invoice of a tenant to `exported` in one
/// transaction and returns them in their exported form.
pub fn export_approved(db: &Database, tenant_id: i64) -> Result<Vec<Invoice>, DatabaseError> {
    let now = now_timestamp();
    db.with_tx(|tx| {
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM invoices WHERE tenant_id = ?1 AND review_state = 'approved'
                 ORDER BY invoice_date ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![tenant_id], |r| r.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut exported = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE invoices SET review_state = 'exported', exported_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND review_state = 'approved'",
                params![id, now],
            )?;
            exported.push(tx.query_row(
                "SELECT * FROM invoices WHERE id = ?1",
                params![id],
                Invoice::from_row,
            )?);
        }

        Ok(exported)
    })
}
