//! Invoice records and their human-review lifecycle.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below this score an invoice is flagged for careful review.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 80.0;

/// At or above this score an invoice is considered high confidence.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 95.0;

/// Prefix of the note attached to low-confidence invoices.
pub const LOW_CONFIDENCE_MARKER: &str = "[BAJA CONFIANZA]";

/// Review lifecycle of an invoice, independent of job processing status.
///
/// `Pending → Ready → Approved → Exported`; any non-terminal state may be
/// `Rejected`. `Exported` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Ready,
    Approved,
    Exported,
    Rejected,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewState::Pending => "pending",
            ReviewState::Ready => "ready",
            ReviewState::Approved => "approved",
            ReviewState::Exported => "exported",
            ReviewState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReviewState::Exported | ReviewState::Rejected)
    }

    /// Whether extracted fields may still be corrected.
    pub fn is_editable(self) -> bool {
        matches!(self, ReviewState::Pending | ReviewState::Ready)
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown review state '{0}'")]
pub struct UnknownReviewState(pub String);

impl FromStr for ReviewState {
    type Err = UnknownReviewState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewState::Pending),
            "ready" => Ok(ReviewState::Ready),
            "approved" => Ok(ReviewState::Approved),
            "exported" => Ok(ReviewState::Exported),
            "rejected" => Ok(ReviewState::Rejected),
            other => Err(UnknownReviewState(other.to_string())),
        }
    }
}

impl FromSql for ReviewState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ReviewState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Monetary amounts of a fiscal document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Amounts {
    pub goods: f64,
    pub services: f64,
    /// ITBIS (value-added tax).
    pub itbis: f64,
    /// ISC (selective consumption tax).
    pub selective_tax: f64,
    pub other_taxes: f64,
    /// Legal 10% gratuity.
    pub tip: f64,
    pub total: f64,
}

/// Extracted document fields, as produced by the extraction gateway or
/// corrected by a reviewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvoiceFields {
    /// Issue date, `YYYY-MM-DD`.
    pub date: Option<String>,
    /// Vendor RNC or cédula.
    pub fiscal_id: Option<String>,
    /// NCF (fiscal receipt number).
    pub document_number: Option<String>,
    pub vendor_name: Option<String>,
    pub amounts: Amounts,
    pub payment_method: Option<String>,
    pub expense_category: Option<String>,
    pub id_type: Option<String>,
}

/// Input for creating the invoice of a processed job.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: i64,
    pub submitter_id: i64,
    pub job_id: i64,
    pub fields: InvoiceFields,
    pub confidence_score: f64,
    pub storage_url: String,
    pub notes: Option<String>,
}

/// A persisted invoice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: i64,
    pub tenant_id: i64,
    pub submitter_id: i64,
    pub job_id: i64,
    #[serde(flatten)]
    pub fields: InvoiceFields,
    pub confidence_score: f64,
    pub review_state: ReviewState,
    pub storage_url: String,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub reviewed_at: Option<String>,
    pub exported_at: Option<String>,
}

impl Invoice {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            submitter_id: row.get("submitter_id")?,
            job_id: row.get("job_id")?,
            fields: InvoiceFields {
                date: row.get("invoice_date")?,
                fiscal_id: row.get("fiscal_id")?,
                document_number: row.get("document_number")?,
                vendor_name: row.get("vendor_name")?,
                amounts: Amounts {
                    goods: row.get("amount_goods")?,
                    services: row.get("amount_services")?,
                    itbis: row.get("itbis")?,
                    selective_tax: row.get("selective_tax")?,
                    other_taxes: row.get("other_taxes")?,
                    tip: row.get("tip")?,
                    total: row.get("total")?,
                },
                payment_method: row.get("payment_method")?,
                expense_category: row.get("expense_category")?,
                id_type: row.get("id_type")?,
            },
            confidence_score: row.get("confidence_score")?,
            review_state: row.get("review_state")?,
            storage_url: row.get("storage_url")?,
            notes: row.get("notes")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            reviewed_at: row.get("reviewed_at")?,
            exported_at: row.get("exported_at")?,
        })
    }
}

/// Reviewer corrections. Only the fields that are `Some` are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvoiceUpdate {
    pub date: Option<String>,
    pub fiscal_id: Option<String>,
    pub document_number: Option<String>,
    pub vendor_name: Option<String>,
    pub amount_goods: Option<f64>,
    pub amount_services: Option<f64>,
    pub itbis: Option<f64>,
    pub selective_tax: Option<f64>,
    pub other_taxes: Option<f64>,
    pub tip: Option<f64>,
    pub total: Option<f64>,
    pub payment_method: Option<String>,
    pub expense_category: Option<String>,
    pub id_type: Option<String>,
    pub notes: Option<String>,
}

impl InvoiceUpdate {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.fiscal_id.is_none()
            && self.document_number.is_none()
            && self.vendor_name.is_none()
            && self.amount_goods.is_none()
            && self.amount_services.is_none()
            && self.itbis.is_none()
            && self.selective_tax.is_none()
            && self.other_taxes.is_none()
            && self.tip.is_none()
            && self.total.is_none()
            && self.payment_method.is_none()
            && self.expense_category.is_none()
            && self.id_type.is_none()
            && self.notes.is_none()
    }
}

/// Clamps an extraction score into `0..=100`; NaN becomes 0.
pub fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// The note attached to an invoice whose score is below
/// [`LOW_CONFIDENCE_THRESHOLD`].
pub fn low_confidence_note(score: f64) -> Option<String> {
    (score < LOW_CONFIDENCE_THRESHOLD).then(|| {
        format!(
            "{} Confianza de extracción {:.0}%: verificar todos los campos contra la imagen.",
            LOW_CONFIDENCE_MARKER, score
        )
    })
}
