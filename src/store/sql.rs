// ABOUTME: Parameterized statement builder for the destination store
// ABOUTME: Identifiers are validated and quoted; values are always bound parameters

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::fmt;

use super::StoreError;
use crate::utils::{quote_ident, validate_column_name, validate_postgres_identifier};

/// A table or column name that passed validation and is safe to quote into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    /// Table names use the strict identifier rules.
    pub fn table(name: &str) -> Result<Self> {
        validate_postgres_identifier(name)
            .with_context(|| format!("Invalid table name '{}'", name))?;
        Ok(Self(name.to_string()))
    }

    /// Column names may carry source spelling within the column allow-list.
    pub fn column(name: &str) -> Result<Self> {
        validate_column_name(name).with_context(|| format!("Invalid column name '{}'", name))?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Native array of identifiers (relationship values)
    TextArray(Vec<String>),
    /// Opaque structured data, serialized when the column is textual
    Json(JsonValue),
}

impl SqlValue {
    /// PostgreSQL's name for the type this value binds as.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "unknown",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "bigint",
            SqlValue::Float(_) => "double precision",
            SqlValue::Decimal(_) => "numeric",
            SqlValue::Text(_) => "text",
            SqlValue::Timestamp(_) => "timestamp with time zone",
            SqlValue::TextArray(_) => "text[]",
            SqlValue::Json(_) => "jsonb",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Float(f) => Some(*f),
            SqlValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Decimal(d) => Some(*d),
            SqlValue::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Textual rendering used when a value lands in a text column.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Decimal(d) => Some(d.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            SqlValue::TextArray(items) => Some(JsonValue::from(items.clone()).to_string()),
            SqlValue::Json(v) => Some(v.to_string()),
        }
    }

    pub fn to_text_array(&self) -> Option<Vec<String>> {
        match self {
            SqlValue::TextArray(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(JsonValue::Bool(*b)),
            SqlValue::Int(i) => Some(JsonValue::from(*i)),
            SqlValue::Float(f) => Some(
                serde_json::Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(f.to_string())),
            ),
            SqlValue::Decimal(d) => Some(JsonValue::String(d.to_string())),
            SqlValue::Text(s) => Some(JsonValue::String(s.clone())),
            SqlValue::Timestamp(ts) => Some(JsonValue::String(ts.to_rfc3339())),
            SqlValue::TextArray(items) => Some(JsonValue::from(items.clone())),
            SqlValue::Json(v) => Some(v.clone()),
        }
    }
}

/// Declared type of a destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    TextArray,
    Json,
    Jsonb,
    Other(String),
}

impl ColumnKind {
    /// Parse a type as reported by `information_schema.columns`.
    ///
    /// `data_type` is the SQL-standard name; for arrays it is `ARRAY` and the
    /// element type comes from `udt_name` (e.g. `_text`). Short aliases such
    /// as `int8`, `timestamptz` or `text[]` are accepted too.
    pub fn parse(data_type: &str, udt_name: Option<&str>) -> Self {
        let normalized = data_type.trim().to_ascii_lowercase();
        if normalized == "user-defined" {
            return match udt_name.map(|u| u.to_ascii_lowercase()).as_deref() {
                Some("citext") => ColumnKind::Text,
                Some(udt) => ColumnKind::Other(udt.to_string()),
                None => ColumnKind::Other(data_type.to_string()),
            };
        }
        if normalized == "array" {
            return match udt_name.map(|u| u.to_ascii_lowercase()).as_deref() {
                Some("_text") | Some("_varchar") | Some("_bpchar") => ColumnKind::TextArray,
                _ => ColumnKind::Other(data_type.to_string()),
            };
        }

        match normalized.as_str() {
            "smallint" | "int2" => ColumnKind::SmallInt,
            "integer" | "int" | "int4" => ColumnKind::Integer,
            "bigint" | "int8" => ColumnKind::BigInt,
            "real" | "float4" => ColumnKind::Real,
            "double precision" | "float8" => ColumnKind::Double,
            "numeric" | "decimal" => ColumnKind::Numeric,
            "boolean" | "bool" => ColumnKind::Boolean,
            "text" | "character varying" | "varchar" | "character" | "char" | "bpchar"
            | "name" | "citext" => ColumnKind::Text,
            "timestamp without time zone" | "timestamp" => ColumnKind::Timestamp,
            "timestamp with time zone" | "timestamptz" => ColumnKind::TimestampTz,
            "date" => ColumnKind::Date,
            "text[]" | "_text" | "character varying[]" | "varchar[]" | "_varchar" => {
                ColumnKind::TextArray
            }
            "json" => ColumnKind::Json,
            "jsonb" => ColumnKind::Jsonb,
            _ => ColumnKind::Other(data_type.to_string()),
        }
    }

    /// Name used in PostgreSQL-style error messages.
    pub fn type_name(&self) -> &str {
        match self {
            ColumnKind::SmallInt => "smallint",
            ColumnKind::Integer => "integer",
            ColumnKind::BigInt => "bigint",
            ColumnKind::Real => "real",
            ColumnKind::Double => "double precision",
            ColumnKind::Numeric => "numeric",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Text => "text",
            ColumnKind::Timestamp => "timestamp without time zone",
            ColumnKind::TimestampTz => "timestamp with time zone",
            ColumnKind::Date => "date",
            ColumnKind::TextArray => "text[]",
            ColumnKind::Json => "json",
            ColumnKind::Jsonb => "jsonb",
            ColumnKind::Other(name) => name,
        }
    }

    /// DDL type emitted by schema patches. Unknown kinds fall back to TEXT so
    /// no unvalidated type name ever reaches SQL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::SmallInt => "SMALLINT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::BigInt => "BIGINT",
            ColumnKind::Real => "REAL",
            ColumnKind::Double => "DOUBLE PRECISION",
            ColumnKind::Numeric => "NUMERIC",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Text | ColumnKind::Other(_) => "TEXT",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::TimestampTz => "TIMESTAMPTZ",
            ColumnKind::Date => "DATE",
            ColumnKind::TextArray => "TEXT[]",
            ColumnKind::Json => "JSON",
            ColumnKind::Jsonb => "JSONB",
        }
    }

    /// Convert a value into this column's domain before binding.
    ///
    /// Lossless conversions are applied (integers into numeric, scalars into
    /// text); anything else is reported as a type mismatch in the same shape
    /// PostgreSQL uses.
    pub fn coerce(&self, column: &str, value: SqlValue) -> Result<SqlValue, StoreError> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }

        let mismatch = |value: &SqlValue| StoreError::TypeMismatch {
            column: column.to_string(),
            column_type: self.type_name().to_string(),
            expression_type: value.type_name().to_string(),
        };

        match self {
            ColumnKind::Text => Ok(value.to_text().map(SqlValue::Text).unwrap_or(SqlValue::Null)),
            // Types such as uuid, enums, bytea or interval have no binding
            // from these values; only NULL gets through.
            ColumnKind::Other(_) => Err(mismatch(&value)),
            ColumnKind::SmallInt | ColumnKind::Integer | ColumnKind::BigInt => {
                let as_int = match &value {
                    SqlValue::Int(i) => Some(*i),
                    SqlValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                        Some(*f as i64).filter(|i| *i as f64 == *f)
                    }
                    SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
                    SqlValue::Text(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                match as_int {
                    Some(i) if self.int_in_range(i) => Ok(SqlValue::Int(i)),
                    _ => Err(mismatch(&value)),
                }
            }
            ColumnKind::Real | ColumnKind::Double => match &value {
                SqlValue::Int(i) => Ok(SqlValue::Float(*i as f64)),
                SqlValue::Float(f) => Ok(SqlValue::Float(*f)),
                SqlValue::Decimal(d) => d.to_f64().map(SqlValue::Float).ok_or_else(|| mismatch(&value)),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(SqlValue::Float)
                    .map_err(|_| mismatch(&value)),
                _ => Err(mismatch(&value)),
            },
            ColumnKind::Numeric => match &value {
                SqlValue::Int(i) => Ok(SqlValue::Decimal(Decimal::from(*i))),
                SqlValue::Decimal(d) => Ok(SqlValue::Decimal(*d)),
                SqlValue::Float(f) => f
                    .to_string()
                    .parse::<Decimal>()
                    .map(SqlValue::Decimal)
                    .map_err(|_| mismatch(&value)),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(SqlValue::Decimal)
                    .map_err(|_| mismatch(&value)),
                _ => Err(mismatch(&value)),
            },
            ColumnKind::Boolean => match &value {
                SqlValue::Bool(b) => Ok(SqlValue::Bool(*b)),
                SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" => Ok(SqlValue::Bool(true)),
                    "false" | "f" => Ok(SqlValue::Bool(false)),
                    _ => Err(mismatch(&value)),
                },
                _ => Err(mismatch(&value)),
            },
            ColumnKind::Timestamp | ColumnKind::TimestampTz | ColumnKind::Date => match &value {
                SqlValue::Timestamp(ts) => Ok(SqlValue::Timestamp(*ts)),
                _ => Err(mismatch(&value)),
            },
            ColumnKind::TextArray => match &value {
                SqlValue::TextArray(items) => Ok(SqlValue::TextArray(items.clone())),
                SqlValue::Json(JsonValue::Array(items)) => items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .map(SqlValue::TextArray)
                    .ok_or_else(|| mismatch(&value)),
                _ => Err(mismatch(&value)),
            },
            ColumnKind::Json | ColumnKind::Jsonb => {
                Ok(value.to_json().map(SqlValue::Json).unwrap_or(SqlValue::Null))
            }
        }
    }

    fn int_in_range(&self, value: i64) -> bool {
        match self {
            ColumnKind::SmallInt => i16::try_from(value).is_ok(),
            ColumnKind::Integer => i32::try_from(value).is_ok(),
            _ => true,
        }
    }
}

/// A statement against the destination store.
///
/// Statements are data: the PostgreSQL store renders them to SQL with `$n`
/// placeholders, the in-process store interprets them directly. Schema
/// alterations are statements too, so an approved patch is a value that can
/// be inspected before it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `INSERT INTO t (cols) VALUES (params)`
    Insert {
        table: Ident,
        values: Vec<(Ident, SqlValue)>,
    },
    /// `UPDATE t SET col = param, .. WHERE key = param`
    UpdateWhereEq {
        table: Ident,
        key: Ident,
        key_value: SqlValue,
        assignments: Vec<(Ident, SqlValue)>,
    },
    /// `SELECT COUNT(*) FROM t WHERE key = param`
    CountWhereEq {
        table: Ident,
        key: Ident,
        key_value: SqlValue,
    },
    /// `SELECT COUNT(*) FROM t`
    CountRows { table: Ident },
    /// `ALTER TABLE t ADD COLUMN IF NOT EXISTS col TYPE`
    AddColumn {
        table: Ident,
        column: Ident,
        kind: ColumnKind,
    },
    /// `ALTER TABLE t ALTER COLUMN col TYPE kind USING col::kind`
    AlterColumnType {
        table: Ident,
        column: Ident,
        kind: ColumnKind,
    },
}

impl Statement {
    pub fn table(&self) -> &Ident {
        match self {
            Statement::Insert { table, .. }
            | Statement::UpdateWhereEq { table, .. }
            | Statement::CountWhereEq { table, .. }
            | Statement::CountRows { table }
            | Statement::AddColumn { table, .. }
            | Statement::AlterColumnType { table, .. } => table,
        }
    }

    /// Whether the statement changes the table's shape.
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::AddColumn { .. } | Statement::AlterColumnType { .. }
        )
    }

    /// Render SQL text with numbered placeholders in [`Statement::params`] order.
    pub fn to_sql(&self) -> String {
        match self {
            Statement::Insert { table, values } => {
                let columns: Vec<String> = values.iter().map(|(c, _)| c.quoted()).collect();
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| format!("${}", i)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table.quoted(),
                    columns.join(", "),
                    placeholders.join(", ")
                )
            }
            Statement::UpdateWhereEq {
                table,
                key,
                assignments,
                ..
            } => {
                let set_clause: Vec<String> = assignments
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{} = ${}", c.quoted(), i + 1))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE {} = ${}",
                    table.quoted(),
                    set_clause.join(", "),
                    key.quoted(),
                    assignments.len() + 1
                )
            }
            Statement::CountWhereEq { table, key, .. } => format!(
                "SELECT COUNT(*) FROM {} WHERE {} = $1",
                table.quoted(),
                key.quoted()
            ),
            Statement::CountRows { table } => format!("SELECT COUNT(*) FROM {}", table.quoted()),
            Statement::AddColumn {
                table,
                column,
                kind,
            } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                table.quoted(),
                column.quoted(),
                kind.sql_type()
            ),
            Statement::AlterColumnType {
                table,
                column,
                kind,
            } => format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                table.quoted(),
                column.quoted(),
                kind.sql_type(),
                column.quoted(),
                kind.sql_type()
            ),
        }
    }

    /// Bound parameters with the column each one targets.
    pub fn params(&self) -> Vec<(&Ident, &SqlValue)> {
        match self {
            Statement::Insert { values, .. } => values.iter().map(|(c, v)| (c, v)).collect(),
            Statement::UpdateWhereEq {
                key,
                key_value,
                assignments,
                ..
            } => assignments
                .iter()
                .map(|(c, v)| (c, v))
                .chain(std::iter::once((key, key_value)))
                .collect(),
            Statement::CountWhereEq { key, key_value, .. } => vec![(key, key_value)],
            Statement::CountRows { .. }
            | Statement::AddColumn { .. }
            | Statement::AlterColumnType { .. } => Vec::new(),
        }
    }
}
