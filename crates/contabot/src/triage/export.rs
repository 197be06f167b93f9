//! Purchase-report rendering of exported invoices.
//!
//! One pipe-delimited line per invoice, columns in 606 order:
//!
//! `fiscal id | id type | expense category | NCF | modified NCF | date
//! (YYYYMMDD) | services | goods | billed (services + goods) | ITBIS | ISC |
//! other taxes | tip | payment method`

use serde::Serialize;

use crate::fiscal_id::FiscalId;
use crate::invoice::Invoice;

/// The invoices moved to `exported` by one export run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBatch {
    pub tenant_id: i64,
    pub invoices: Vec<Invoice>,
    pub lines: Vec<String>,
}

impl ExportBatch {
    pub fn new(tenant_id: i64, invoices: Vec<Invoice>) -> Self {
        let lines = invoices.iter().map(report_line).collect();
        Self {
            tenant_id,
            invoices,
            lines,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }

    /// All lines, newline-terminated.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

pub fn report_line(invoice: &Invoice) -> String {
    let fields = &invoice.fields;
    let amounts = &fields.amounts;

    let parsed_id = fields
        .fiscal_id
        .as_deref()
        .and_then(|raw| FiscalId::parse(raw).ok());
    let fiscal_id = parsed_id
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| cell(fields.fiscal_id.as_deref()));
    let id_type = match fields.id_type.as_deref() {
        Some(code) if !code.trim().is_empty() => cell(Some(code)),
        _ => parsed_id
            .as_ref()
            .map(|id| id.kind().report_code().to_string())
            .unwrap_or_default(),
    };
    let date: String = fields
        .date
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();

    [
        fiscal_id,
        id_type,
        cell(fields.expense_category.as_deref()),
        cell(fields.document_number.as_deref()),
        String::new(),
        date,
        money(amounts.services),
        money(amounts.goods),
        money(amounts.services + amounts.goods),
        money(amounts.itbis),
        money(amounts.selective_tax),
        money(amounts.other_taxes),
        money(amounts.tip),
        cell(fields.payment_method.as_deref()),
    ]
    .join("|")
}

/// Free text without the delimiter or line breaks.
fn cell(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, '|' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn money(value: f64) -> String {
    format!("{:.2}", value)
}
