//! Confidence-based triage of invoices awaiting human review.
//!
//! Bucketing is a pure function of an invoice's review state and
//! extraction score; boards are rebuilt from the store on every read.

pub mod export;
pub mod review;

use serde::Serialize;

use crate::invoice::{Invoice, ReviewState, HIGH_CONFIDENCE_THRESHOLD, LOW_CONFIDENCE_THRESHOLD};

pub use export::{report_line, ExportBatch};
pub use review::{BatchOutcome, ReviewError, ReviewService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    /// Pending, score ≥ 95.
    AltaConfianza,
    /// Pending, 80 ≤ score < 95.
    MediaConfianza,
    /// Pending, score < 80.
    BajaConfianza,
    /// Marked ready by a reviewer, awaiting approval.
    Listas,
}

impl ConfidenceBucket {
    pub fn label(self) -> &'static str {
        match self {
            ConfidenceBucket::AltaConfianza => "Alta confianza",
            ConfidenceBucket::MediaConfianza => "Media confianza",
            ConfidenceBucket::BajaConfianza => "Baja confianza",
            ConfidenceBucket::Listas => "Listas",
        }
    }
}

/// Places an invoice in a bucket. Approved, exported and rejected invoices
/// belong to none.
pub fn classify(state: ReviewState, confidence: f64) -> Option<ConfidenceBucket> {
    match state {
        ReviewState::Pending if confidence >= HIGH_CONFIDENCE_THRESHOLD => {
            Some(ConfidenceBucket::AltaConfianza)
        }
        ReviewState::Pending if confidence >= LOW_CONFIDENCE_THRESHOLD => {
            Some(ConfidenceBucket::MediaConfianza)
        }
        ReviewState::Pending => Some(ConfidenceBucket::BajaConfianza),
        ReviewState::Ready => Some(ConfidenceBucket::Listas),
        ReviewState::Approved | ReviewState::Exported | ReviewState::Rejected => None,
    }
}

/// Review queue grouped by bucket, each in the order given to [`build`](Self::build).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageBoard {
    pub alta_confianza: Vec<Invoice>,
    pub media_confianza: Vec<Invoice>,
    pub baja_confianza: Vec<Invoice>,
    pub listas: Vec<Invoice>,
}

impl TriageBoard {
    pub fn build(invoices: impl IntoIterator<Item = Invoice>) -> Self {
        let mut board = Self::default();
        for invoice in invoices {
            if let Some(bucket) = classify(invoice.review_state, invoice.confidence_score) {
                board.bucket_mut(bucket).push(invoice);
            }
        }
        board
    }

    pub fn bucket(&self, bucket: ConfidenceBucket) -> &[Invoice] {
        match bucket {
            ConfidenceBucket::AltaConfianza => &self.alta_confianza,
            ConfidenceBucket::MediaConfianza => &self.media_confianza,
            ConfidenceBucket::BajaConfianza => &self.baja_confianza,
            ConfidenceBucket::Listas => &self.listas,
        }
    }

    fn bucket_mut(&mut self, bucket: ConfidenceBucket) -> &mut Vec<Invoice> {
        match bucket {
            ConfidenceBucket::AltaConfianza => &mut self.alta_confianza,
            ConfidenceBucket::MediaConfianza => &mut self.media_confianza,
            ConfidenceBucket::BajaConfianza => &mut self.baja_confianza,
            ConfidenceBucket::Listas => &mut self.listas,
        }
    }

    pub fn len(&self) -> usize {
        self.alta_confianza.len()
            + self.media_confianza.len()
            + self.baja_confianza.len()
            + self.listas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
