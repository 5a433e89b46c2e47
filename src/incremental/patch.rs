// ABOUTME: Turns destination schema errors into human-approvable schema patches
// ABOUTME: Parses store errors, records pending requests, executes approved alterations

use anyhow::{anyhow, bail, Context, Result};

use super::mapper::FieldMapper;
use super::schema_type::{Convention, SchemaTypeCache};
use crate::store::{
    ColumnKind, Destination, Ident, NewPatchRequest, PatchKind, PatchRequest, PatchResolution,
    PatchStatus, Statement, SuggestedType,
};

/// A destination error the workflow knows how to repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// `column "X" of relation "Y" does not exist`
    MissingColumn { column: String, relation: String },
    /// `column "X" is of type A but expression is of type B`
    TypeMismatch {
        column: String,
        column_type: String,
        expression_type: String,
    },
}

impl SchemaError {
    pub fn column(&self) -> &str {
        match self {
            SchemaError::MissingColumn { column, .. } | SchemaError::TypeMismatch { column, .. } => {
                column
            }
        }
    }
}

/// Split `s` at the first `"`, returning the quoted text and what follows it.
fn take_quoted(s: &str) -> Option<(&str, &str)> {
    let end = s.find('"')?;
    Some((&s[..end], &s[end + 1..]))
}

/// Recognize a missing-column or type-mismatch error anywhere in `message`.
///
/// Context prefixes added while the error propagated are ignored.
///
/// ```
/// # use api_replicator::incremental::patch::{parse_store_error, SchemaError};
/// let parsed = parse_store_error(r#"column "bonus_pct" of relation "agent_perf" does not exist"#);
/// assert_eq!(
///     parsed,
///     Some(SchemaError::MissingColumn {
///         column: "bonus_pct".into(),
///         relation: "agent_perf".into(),
///     })
/// );
/// ```
pub fn parse_store_error(message: &str) -> Option<SchemaError> {
    let mut search = message;
    while let Some(start) = search.find("column \"") {
        let after = &search[start + "column \"".len()..];
        search = after;

        let Some((column, rest)) = take_quoted(after) else {
            break;
        };

        if let Some(rest) = rest.strip_prefix(" of relation \"") {
            if let Some((relation, tail)) = take_quoted(rest) {
                if tail.starts_with(" does not exist") {
                    return Some(SchemaError::MissingColumn {
                        column: column.to_string(),
                        relation: relation.to_string(),
                    });
                }
            }
            continue;
        }

        if let Some(rest) = rest.strip_prefix(" is of type ") {
            if let Some((column_type, tail)) = rest.split_once(" but expression is of type ") {
                let expression_type = tail
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .trim_end_matches('.');
                if !column_type.is_empty() && !expression_type.is_empty() {
                    return Some(SchemaError::TypeMismatch {
                        column: column.to_string(),
                        column_type: column_type.trim().to_string(),
                        expression_type: expression_type.to_string(),
                    });
                }
            }
        }
    }
    None
}

/// Split a field name into lowercase words at punctuation, spaces and camelCase humps.
fn words(field: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in field.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Guess a column type for a new field from its name.
///
/// Checked in order: date/time names, amount/rate/percent names, count names,
/// boolean prefixes; anything else is text.
///
/// ```
/// # use api_replicator::incremental::patch::infer_type_from_field_name;
/// # use api_replicator::store::SuggestedType;
/// assert_eq!(infer_type_from_field_name("bonus_pct"), SuggestedType::Decimal);
/// assert_eq!(infer_type_from_field_name("Closed At"), SuggestedType::Timestamp);
/// ```
pub fn infer_type_from_field_name(field: &str) -> SuggestedType {
    let words = words(field);
    let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(&w.as_str()));

    if has(&["date", "time", "timestamp", "at", "on", "day"])
        || words
            .iter()
            .any(|w| w.ends_with("date") || w.ends_with("time"))
    {
        return SuggestedType::Timestamp;
    }

    if field.contains('%')
        || has(&[
            "amount",
            "rate",
            "percent",
            "percentage",
            "pct",
            "price",
            "cost",
            "revenue",
            "fee",
        ])
    {
        return SuggestedType::Decimal;
    }

    if has(&["count", "qty", "quantity", "num", "number"])
        || words.iter().any(|w| w.ends_with("count"))
    {
        return SuggestedType::Integer;
    }

    if matches!(
        words.first().map(String::as_str),
        Some("is" | "has" | "can" | "should")
    ) {
        return SuggestedType::Boolean;
    }

    SuggestedType::Text
}

/// The wider of two column types: equal types stay, integer and decimal
/// widen to decimal, anything else falls back to text.
pub fn more_permissive(a: SuggestedType, b: SuggestedType) -> SuggestedType {
    use SuggestedType::{Decimal, Integer, Text};
    match (a, b) {
        (a, b) if a == b => a,
        (Integer, Decimal) | (Decimal, Integer) => Decimal,
        _ => Text,
    }
}

/// An approved schema alteration, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaPatchCommand {
    pub kind: PatchKind,
    pub table: Ident,
    pub column: Ident,
    pub target: ColumnKind,
}

impl SchemaPatchCommand {
    pub fn from_request(request: &PatchRequest) -> Result<Self> {
        Ok(Self {
            kind: request.kind,
            table: Ident::table(&request.table_name)?,
            column: Ident::column(&request.field_name)?,
            target: request.suggested_type.column_kind(),
        })
    }

    pub fn statement(&self) -> Statement {
        match self.kind {
            PatchKind::AddColumn => Statement::AddColumn {
                table: self.table.clone(),
                column: self.column.clone(),
                kind: self.target.clone(),
            },
            PatchKind::AlterColumnType => Statement::AlterColumnType {
                table: self.table.clone(),
                column: self.column.clone(),
                kind: self.target.clone(),
            },
        }
    }
}

/// What the sync knew about the failing record.
#[derive(Debug, Clone)]
pub struct PatchContext {
    pub table: String,
    pub convention: Convention,
    /// Source field names of the failing record, used to recover the original name
    pub source_fields: Vec<String>,
    pub record_id: Option<String>,
}

/// Creates, approves and rejects schema patch requests.
pub struct SchemaPatchWorkflow<'a, D: ?Sized> {
    store: &'a D,
    schema_cache: &'a SchemaTypeCache,
}

impl<'a, D> SchemaPatchWorkflow<'a, D>
where
    D: Destination + ?Sized,
{
    pub fn new(store: &'a D, schema_cache: &'a SchemaTypeCache) -> Self {
        Self {
            store,
            schema_cache,
        }
    }

    /// Record a pending patch for a schema error.
    ///
    /// Returns `None` when the error is not a recognized schema error or a
    /// pending request for the same (table, field) already exists.
    pub async fn create_pending_request(
        &self,
        error_message: &str,
        run_id: Option<&str>,
        context: &PatchContext,
    ) -> Result<Option<PatchRequest>> {
        let Some(schema_error) = parse_store_error(error_message) else {
            tracing::debug!(
                "Not a schema error, no patch created for {}: {}",
                context.table,
                error_message
            );
            return Ok(None);
        };

        let field_name = schema_error.column().to_string();
        if Ident::column(&field_name).is_err() {
            tracing::warn!(
                "Cannot propose a patch for invalid column name '{}'",
                field_name
            );
            return Ok(None);
        }

        let original_field_name = context
            .source_fields
            .iter()
            .find(|f| FieldMapper::map_field(f, context.convention) == field_name)
            .cloned()
            .unwrap_or_else(|| field_name.clone());

        let (kind, suggested_type, current_type) = match &schema_error {
            SchemaError::MissingColumn { .. } => (
                PatchKind::AddColumn,
                infer_type_from_field_name(&original_field_name),
                None,
            ),
            SchemaError::TypeMismatch {
                column_type,
                expression_type,
                ..
            } => {
                let current = SuggestedType::from_column_kind(&ColumnKind::parse(column_type, None));
                let incoming =
                    SuggestedType::from_column_kind(&ColumnKind::parse(expression_type, None));
                (
                    PatchKind::AlterColumnType,
                    more_permissive(current, incoming),
                    Some(column_type.clone()),
                )
            }
        };

        if let Some(existing) = self
            .store
            .find_pending_patch(&context.table, &field_name)
            .await?
        {
            tracing::debug!(
                "Schema patch {} already pending for {}.{}",
                existing.id,
                context.table,
                field_name
            );
            return Ok(None);
        }

        let request = NewPatchRequest {
            table_name: context.table.clone(),
            field_name,
            original_field_name,
            kind,
            suggested_type,
            current_type,
            error_message: error_message.to_string(),
            sync_run_id: run_id.map(str::to_string),
        };

        let created = self.store.insert_patch(&request).await?;
        if let Some(ref patch) = created {
            tracing::info!(
                "Schema patch {} pending: {} {}.{} as {} (record {})",
                patch.id,
                patch.kind.as_str(),
                patch.table_name,
                patch.field_name,
                patch.suggested_type,
                context.record_id.as_deref().unwrap_or("unknown")
            );
        }
        Ok(created)
    }

    /// Execute a pending patch and record the outcome.
    ///
    /// The returned request is `approved` when the alteration ran and
    /// `failed` (with the store's error) when it did not.
    pub async fn approve(&self, id: i64, approved_by: &str) -> Result<PatchRequest> {
        let patch = self.get_pending(id).await?;
        let command = SchemaPatchCommand::from_request(&patch)
            .with_context(|| format!("Schema patch {} cannot be executed", id))?;
        let statement = command.statement();

        let resolution = match self.store.execute(&statement).await {
            Ok(_) => {
                tracing::info!("Schema patch {} applied: {}", id, statement.to_sql());
                PatchResolution::Approved {
                    by: approved_by.to_string(),
                    result: format!("executed: {}", statement.to_sql()),
                }
            }
            Err(e) => {
                tracing::warn!("Schema patch {} failed: {}", id, e);
                PatchResolution::Failed {
                    by: approved_by.to_string(),
                    error: e.to_string(),
                }
            }
        };

        self.schema_cache.invalidate(self.store, &patch.table_name);
        self.store.resolve_patch(id, &resolution).await
    }

    /// Decline a pending patch. Nothing is executed.
    pub async fn reject(&self, id: i64, rejected_by: &str, reason: &str) -> Result<PatchRequest> {
        self.get_pending(id).await?;
        let resolved = self
            .store
            .resolve_patch(
                id,
                &PatchResolution::Rejected {
                    by: rejected_by.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        tracing::info!("Schema patch {} rejected by {}", id, rejected_by);
        Ok(resolved)
    }

    pub async fn list_pending(&self, table: Option<&str>) -> Result<Vec<PatchRequest>> {
        self.store
            .list_patches(Some(PatchStatus::Pending), table)
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<PatchRequest>> {
        self.store.get_patch(id).await
    }

    async fn get_pending(&self, id: i64) -> Result<PatchRequest> {
        let patch = self
            .store
            .get_patch(id)
            .await?
            .ok_or_else(|| anyhow!("Schema patch {} not found", id))?;
        if patch.status != PatchStatus::Pending {
            bail!("Schema patch {} is already {}", id, patch.status);
        }
        Ok(patch)
    }
}
