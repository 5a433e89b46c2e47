// ABOUTME: Bookkeeping records persisted next to the replicated tables
// ABOUTME: Cursor records per table and human-approvable schema patch requests

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::sql::ColumnKind;

/// Durable pagination offset for one destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    /// Destination table name (unique key)
    pub table_name: String,
    /// Number of records already retrieved from the source for this table
    pub last_cursor: u64,
    /// When the cursor was last written
    pub last_sync_at: DateTime<Utc>,
    /// Run that wrote the cursor
    pub sync_run_id: Option<String>,
}

/// Lifecycle of a schema patch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    Pending,
    Approved,
    Rejected,
    Failed,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Pending => "pending",
            PatchStatus::Approved => "approved",
            PatchStatus::Rejected => "rejected",
            PatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for PatchStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(PatchStatus::Pending),
            "approved" => Ok(PatchStatus::Approved),
            "rejected" => Ok(PatchStatus::Rejected),
            "failed" => Ok(PatchStatus::Failed),
            other => bail!("unknown patch status: {other}"),
        }
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Which schema alteration a patch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    /// `ALTER TABLE .. ADD COLUMN`
    AddColumn,
    /// `ALTER TABLE .. ALTER COLUMN .. TYPE`
    AlterColumnType,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::AddColumn => "add_column",
            PatchKind::AlterColumnType => "alter_column_type",
        }
    }
}

impl FromStr for PatchKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "add_column" => Ok(PatchKind::AddColumn),
            "alter_column_type" => Ok(PatchKind::AlterColumnType),
            other => bail!("unknown patch kind: {other}"),
        }
    }
}

/// Column type a patch proposes. Deliberately a small fixed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedType {
    Timestamp,
    Decimal,
    Integer,
    Boolean,
    Text,
}

impl SuggestedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestedType::Timestamp => "timestamp",
            SuggestedType::Decimal => "decimal",
            SuggestedType::Integer => "integer",
            SuggestedType::Boolean => "boolean",
            SuggestedType::Text => "text",
        }
    }

    /// Destination column kind created for this suggestion.
    pub fn column_kind(&self) -> ColumnKind {
        match self {
            SuggestedType::Timestamp => ColumnKind::TimestampTz,
            SuggestedType::Decimal => ColumnKind::Numeric,
            SuggestedType::Integer => ColumnKind::BigInt,
            SuggestedType::Boolean => ColumnKind::Boolean,
            SuggestedType::Text => ColumnKind::Text,
        }
    }

    /// Classify an existing destination column kind into the suggestion set.
    ///
    /// Anything without a close match is treated as text.
    pub fn from_column_kind(kind: &ColumnKind) -> Self {
        match kind {
            ColumnKind::SmallInt | ColumnKind::Integer | ColumnKind::BigInt => {
                SuggestedType::Integer
            }
            ColumnKind::Real | ColumnKind::Double | ColumnKind::Numeric => SuggestedType::Decimal,
            ColumnKind::Boolean => SuggestedType::Boolean,
            ColumnKind::Timestamp | ColumnKind::TimestampTz | ColumnKind::Date => {
                SuggestedType::Timestamp
            }
            _ => SuggestedType::Text,
        }
    }
}

impl FromStr for SuggestedType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "timestamp" => Ok(SuggestedType::Timestamp),
            "decimal" => Ok(SuggestedType::Decimal),
            "integer" => Ok(SuggestedType::Integer),
            "boolean" => Ok(SuggestedType::Boolean),
            "text" => Ok(SuggestedType::Text),
            other => bail!("unknown suggested type: {other}"),
        }
    }
}

impl fmt::Display for SuggestedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A patch request about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPatchRequest {
    pub table_name: String,
    pub field_name: String,
    pub original_field_name: String,
    pub kind: PatchKind,
    pub suggested_type: SuggestedType,
    /// Column type reported by the store for type-mismatch patches
    pub current_type: Option<String>,
    pub error_message: String,
    pub sync_run_id: Option<String>,
}

/// A persisted schema patch request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchRequest {
    pub id: i64,
    pub table_name: String,
    pub field_name: String,
    pub original_field_name: String,
    pub kind: PatchKind,
    pub suggested_type: SuggestedType,
    pub current_type: Option<String>,
    pub error_message: String,
    pub sync_run_id: Option<String>,
    pub status: PatchStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_result: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
}

impl PatchRequest {
    /// Materialize a freshly inserted pending request.
    pub fn from_new(id: i64, new: &NewPatchRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            table_name: new.table_name.clone(),
            field_name: new.field_name.clone(),
            original_field_name: new.original_field_name.clone(),
            kind: new.kind,
            suggested_type: new.suggested_type,
            current_type: new.current_type.clone(),
            error_message: new.error_message.clone(),
            sync_run_id: new.sync_run_id.clone(),
            status: PatchStatus::Pending,
            created_at,
            approved_at: None,
            approved_by: None,
            executed_at: None,
            execution_result: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
        }
    }
}

/// Terminal transition recorded for a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchResolution {
    /// The alteration executed; `result` describes what ran
    Approved { by: String, result: String },
    /// The alteration was attempted and the store rejected it
    Failed { by: String, error: String },
    /// A reviewer declined the change; nothing was executed
    Rejected { by: String, reason: String },
}

impl PatchResolution {
    pub fn status(&self) -> PatchStatus {
        match self {
            PatchResolution::Approved { .. } => PatchStatus::Approved,
            PatchResolution::Failed { .. } => PatchStatus::Failed,
            PatchResolution::Rejected { .. } => PatchStatus::Rejected,
        }
    }

    /// Apply the transition to an in-memory request.
    pub fn apply_to(&self, request: &mut PatchRequest, at: DateTime<Utc>) {
        request.status = self.status();
        match self {
            PatchResolution::Approved { by, result } => {
                request.approved_at = Some(at);
                request.approved_by = Some(by.clone());
                request.executed_at = Some(at);
                request.execution_result = Some(result.clone());
            }
            PatchResolution::Failed { by, error } => {
                request.approved_at = Some(at);
                request.approved_by = Some(by.clone());
                request.executed_at = Some(at);
                request.execution_result = Some(error.clone());
            }
            PatchResolution::Rejected { by, reason } => {
                request.rejected_at = Some(at);
                request.rejected_by = Some(by.clone());
                request.rejection_reason = Some(reason.clone());
            }
        }
    }
}
