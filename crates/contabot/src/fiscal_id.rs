//! Dominican fiscal identifiers (RNC and cédula).
//!
//! Users type these with or without separators (`130-12345-6`, `130123456`,
//! `001-1234567-8`). Every lookup goes through [`FiscalId::parse`] so the
//! formatted and unformatted spellings resolve to the same tenant.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digits in a company RNC.
pub const RNC_LEN: usize = 9;
/// Digits in a personal cédula.
pub const CEDULA_LEN: usize = 11;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FiscalIdError {
    #[error("fiscal id contains no digits")]
    Empty,

    #[error("fiscal id must have {RNC_LEN} or {CEDULA_LEN} digits, got {0}")]
    InvalidLength(usize),
}

/// Which kind of identifier a normalized fiscal id is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiscalIdKind {
    Rnc,
    Cedula,
}

impl FiscalIdKind {
    /// Id-type code used in purchase reports (1 = RNC, 2 = cédula).
    pub fn report_code(self) -> &'static str {
        match self {
            FiscalIdKind::Rnc => "1",
            FiscalIdKind::Cedula => "2",
        }
    }
}

/// A validated, digits-only fiscal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FiscalId(String);

impl FiscalId {
    /// Strips separators and validates the digit count.
    pub fn parse(input: &str) -> Result<Self, FiscalIdError> {
        let digits = normalize(input);
        match digits.len() {
            0 => Err(FiscalIdError::Empty),
            RNC_LEN | CEDULA_LEN => Ok(Self(digits)),
            n => Err(FiscalIdError::InvalidLength(n)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> FiscalIdKind {
        if self.0.len() == RNC_LEN {
            FiscalIdKind::Rnc
        } else {
            FiscalIdKind::Cedula
        }
    }
}

impl fmt::Display for FiscalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FiscalId {
    type Error = FiscalIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FiscalId> for String {
    fn from(id: FiscalId) -> Self {
        id.0
    }
}

/// Keeps only ASCII digits.
pub fn normalize(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}
