//! User-facing texts sent through the messaging gateway.

use crate::invoice::{Invoice, LOW_CONFIDENCE_THRESHOLD};

pub const START_COMMAND: &str = "/start";

pub const FISCAL_ID_PROMPT: &str = "Hola 👋 Para registrar tus facturas necesito saber a qué \
empresa perteneces. Responde con el RNC (9 dígitos) o la cédula (11 dígitos) de la empresa.";

pub const INVALID_FISCAL_ID: &str =
    "El RNC debe tener 9 dígitos y la cédula 11. Revisa el número y envíalo de nuevo.";

pub const INVOICE_RECEIVED: &str =
    "📥 Factura recibida. Te aviso cuando termine de procesarla.";

pub const PROCESSING_FAILED: &str = "❌ No pudimos procesar tu factura después de varios \
intentos. Por favor envíala de nuevo con una foto clara y completa.";

pub fn unknown_fiscal_id(fiscal_id: &str) -> String {
    format!(
        "No encontré ninguna empresa registrada con el número {}. \
         Verifica con tu contable e inténtalo otra vez.",
        fiscal_id
    )
}

pub fn bound(tenant_name: &str, queued: usize) -> String {
    let mut text = format!("✅ Listo, quedaste vinculado a {}.", tenant_name);
    if queued > 0 {
        text.push_str(&format!(
            " Ya estoy procesando {} factura(s) que enviaste antes.",
            queued
        ));
    }
    text
}

pub fn bound_hint(tenant_name: &str) -> String {
    format!(
        "Estás vinculado a {}. Envíame la foto o el PDF de una factura para registrarla.",
        tenant_name
    )
}

pub fn invoice_processed(invoice: &Invoice) -> String {
    let vendor = invoice
        .fields
        .vendor_name
        .as_deref()
        .unwrap_or("proveedor sin identificar");
    let mut text = format!(
        "✅ Factura #{} procesada: {} por RD${:.2}.",
        invoice.id, vendor, invoice.fields.amounts.total
    );
    if invoice.confidence_score < LOW_CONFIDENCE_THRESHOLD {
        text.push_str(" Tu contable revisará los datos manualmente.");
    }
    text
}

pub fn invoice_rejected(reason: &str) -> String {
    format!(
        "⚠️ Esta factura fue rechazada: {}. Por favor envíala de nuevo.",
        reason
    )
}
