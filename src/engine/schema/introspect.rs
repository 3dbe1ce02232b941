//! Read-only catalog queries run through the administrative channel to give
//! fix generation the live schema around a failing object.

use serde::{Deserialize, Serialize};

use super::classify::ErrorClass;
use crate::clients::AdminChannel;
use crate::error::AppError;

/// Columns listed from other tables when looking for a renamed column.
const SIMILAR_COLUMN_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub column_name: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub is_nullable: String,
}

/// Live schema facts gathered for one error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_exists: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub table_columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub similar_columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_source: Option<String>,
}

/// Accept only plain identifiers; anything else never reaches a query.
fn identifier(name: &str) -> Option<&str> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Quote a string literal for the admin channel.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn rows<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Vec<T> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub async fn table_columns(admin: &dyn AdminChannel, table: &str) -> Result<Vec<ColumnInfo>, AppError> {
    let Some(table) = identifier(table) else {
        return Ok(Vec::new());
    };
    let sql = format!(
        "SELECT table_name, column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = {} \
         ORDER BY ordinal_position",
        quote_literal(table)
    );
    Ok(rows(admin.query(&sql).await?))
}

pub async fn table_exists(admin: &dyn AdminChannel, table: &str) -> Result<bool, AppError> {
    let Some(table) = identifier(table) else {
        return Ok(false);
    };
    let sql = format!(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name = {}",
        quote_literal(table)
    );
    let found: Vec<serde_json::Value> = rows(admin.query(&sql).await?);
    Ok(!found.is_empty())
}

/// Tables other than `exclude_table` that have a column named `column`.
pub async fn column_elsewhere(
    admin: &dyn AdminChannel,
    column: &str,
    exclude_table: Option<&str>,
) -> Result<Vec<ColumnInfo>, AppError> {
    let Some(column) = identifier(column) else {
        return Ok(Vec::new());
    };
    let mut sql = format!(
        "SELECT table_name, column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND column_name = {}",
        quote_literal(column)
    );
    if let Some(exclude) = exclude_table.and_then(identifier) {
        sql.push_str(&format!(" AND table_name <> {}", quote_literal(exclude)));
    }
    sql.push_str(&format!(" LIMIT {SIMILAR_COLUMN_LIMIT}"));
    Ok(rows(admin.query(&sql).await?))
}

#[derive(Deserialize)]
struct FunctionDef {
    #[serde(default)]
    definition: Option<String>,
}

pub async fn function_source(admin: &dyn AdminChannel, function: &str) -> Result<Option<String>, AppError> {
    let Some(function) = identifier(function) else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT pg_get_functiondef(p.oid) AS definition \
         FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE n.nspname = 'public' AND p.proname = {} \
         LIMIT 1",
        quote_literal(function)
    );
    let defs: Vec<FunctionDef> = rows(admin.query(&sql).await?);
    Ok(defs.into_iter().find_map(|d| d.definition))
}

/// Gather whatever context applies to `class`.
pub async fn gather(admin: &dyn AdminChannel, class: &ErrorClass) -> Result<SchemaContext, AppError> {
    let mut ctx = SchemaContext::default();
    match class {
        ErrorClass::MissingColumn { table, column } => {
            if let Some(table) = table {
                ctx.table_columns = table_columns(admin, table).await?;
                ctx.table_exists = Some(!ctx.table_columns.is_empty());
            }
            if let Some(column) = column {
                ctx.similar_columns = column_elsewhere(admin, column, table.as_deref()).await?;
            }
        }
        ErrorClass::MissingRelation { relation } => {
            if let Some(relation) = relation {
                ctx.table_exists = Some(table_exists(admin, relation).await?);
            }
        }
        ErrorClass::BrokenFunctionReference { function, relation } => {
            if let Some(function) = function {
                ctx.function_source = function_source(admin, function).await?;
            }
            if let Some(relation) = relation {
                ctx.table_exists = Some(table_exists(admin, relation).await?);
            }
        }
    }
    Ok(ctx)
}
