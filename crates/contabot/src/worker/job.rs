use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processing status of a queued job.
///
/// Legal transitions: `Pending → Processing → {Completed | Pending | Failed}`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// How the messaging platform delivered a file. Sending it back must use
/// the same kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    #[default]
    Photo,
    Document,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Photo => "photo",
            AttachmentKind::Document => "document",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown attachment kind '{0}'")]
pub struct UnknownAttachmentKind(pub String);

impl FromStr for AttachmentKind {
    type Err = UnknownAttachmentKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(AttachmentKind::Photo),
            "document" => Ok(AttachmentKind::Document),
            other => Err(UnknownAttachmentKind(other.to_string())),
        }
    }
}

impl FromSql for AttachmentKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for AttachmentKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Everything the intake side knows about a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub tenant_id: i64,
    pub submitter_id: i64,
    /// Opaque messaging-gateway file handle.
    pub attachment_ref: String,
    pub attachment_kind: AttachmentKind,
    pub mime_type: String,
    pub file_ext: String,
    /// External message id, used to correlate notifications.
    pub correlation_id: String,
}

impl NewJob {
    /// Derives the file extension from the MIME type when the messaging
    /// platform did not send a filename.
    pub fn extension_for_mime(mime_type: &str) -> String {
        mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|exts| {
                // mime_guess lists "jpe" before "jpg" for image/jpeg
                exts.iter()
                    .find(|e| **e == "jpg")
                    .or_else(|| exts.first())
                    .copied()
            })
            .unwrap_or("bin")
            .to_string()
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub tenant_id: i64,
    pub submitter_id: i64,
    pub attachment_ref: String,
    pub attachment_kind: AttachmentKind,
    pub mime_type: String,
    pub file_ext: String,
    pub correlation_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub next_attempt_at: Option<String>,
}

impl Job {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            submitter_id: row.get("submitter_id")?,
            attachment_ref: row.get("attachment_ref")?,
            attachment_kind: row.get("attachment_kind")?,
            mime_type: row.get("mime_type")?,
            file_ext: row.get("file_ext")?,
            correlation_id: row.get("correlation_id")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            next_attempt_at: row.get("next_attempt_at")?,
        })
    }

    /// Attempts left before the job is failed for good.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
