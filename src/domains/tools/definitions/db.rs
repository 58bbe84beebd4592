//! Declarative SQL query tools backed by SQLite.
//!
//! Descriptor shape:
//!
//! ```json
//! {
//!   "implementation_locator": "db:sqlite://data/filings.db",
//!   "config": {
//!     "query": "SELECT form, filed_at FROM filings WHERE cik = ? LIMIT ?",
//!     "params": ["cik", "limit"]
//!   }
//! }
//! ```
//!
//! Each `?` is bound from the argument named at the same position in
//! `params`. Rows come back as JSON objects keyed by column name.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Number, Value, json};
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domains::tools::capability::{JsonObject, Tool, ToolCore, ToolKind};
use crate::domains::tools::descriptor::ToolDescriptor;
use crate::domains::tools::error::ExecutionError;
use crate::domains::tools::schema::ToolSchema;

const MAX_CONNECTIONS: u32 = 4;

/// A tool that runs one parameterized SQL query.
pub struct DbQueryTool {
    core: ToolCore,
    pool: SqlitePool,
    query: String,
    params: Vec<String>,
}

impl DbQueryTool {
    /// Build the tool. The pool connects lazily on first execution.
    pub fn new(
        descriptor: Arc<ToolDescriptor>,
        schema: ToolSchema,
        url: &str,
    ) -> Result<Self, String> {
        let query = descriptor
            .config_str("query")
            .ok_or_else(|| "config.query is required for db tools".to_string())?
            .to_string();

        let params = match descriptor.config.get("params") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "config.params must be a list of argument names".to_string())
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err("config.params must be a list of argument names".to_string()),
        };

        let placeholders = query.matches('?').count();
        if placeholders != params.len() {
            return Err(format!(
                "query has {} placeholders but config.params names {}",
                placeholders,
                params.len()
            ));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_lazy(url)
            .map_err(|e| format!("invalid database URL '{}': {}", url, e))?;

        Ok(Self {
            core: ToolCore::new(descriptor, schema),
            pool,
            query,
            params,
        })
    }
}

#[async_trait]
impl Tool for DbQueryTool {
    fn describe(&self) -> Arc<ToolDescriptor> {
        self.core.descriptor.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::DbQuery
    }

    fn schema(&self) -> &ToolSchema {
        &self.core.schema
    }

    #[instrument(skip_all, fields(tool = %self.core.name()))]
    async fn execute(&self, args: JsonObject) -> Result<Value, ExecutionError> {
        let mut query = sqlx::query::<Sqlite>(&self.query);
        for name in &self.params {
            query = match args.get(name) {
                None | Some(Value::Null) => query.bind(Option::<String>::None),
                Some(Value::Bool(b)) => query.bind(*b),
                Some(Value::Number(n)) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                Some(Value::String(s)) => query.bind(s.clone()),
                Some(other) => query.bind(other.to_string()),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ExecutionError::failed(format!("query failed: {}", e)))?;
        debug!("Query returned {} rows", rows.len());

        let rows = rows
            .iter()
            .map(row_to_json)
            .collect::<Result<Vec<_>, _>>()?;
        let count = rows.len();
        Ok(json!({ "rows": rows, "count": count }))
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Value, ExecutionError> {
    let mut object = JsonObject::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let (is_null, type_name) = {
            let raw = row
                .try_get_raw(idx)
                .map_err(|e| ExecutionError::parse(e.to_string()))?;
            (raw.is_null(), raw.type_info().name().to_string())
        };

        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(decode::<i64>(row, idx)?),
                "REAL" => Number::from_f64(decode::<f64>(row, idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(BASE64.encode(decode::<Vec<u8>>(row, idx)?)),
                _ => Value::String(decode::<String>(row, idx)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

fn decode<'r, T>(row: &'r SqliteRow, idx: usize) -> Result<T, ExecutionError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get::<T, _>(idx)
        .map_err(|e| ExecutionError::parse(format!("column {}: {}", idx, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(config: Value) -> Arc<ToolDescriptor> {
        Arc::new(
            serde_json::from_value(json!({
                "name": "filings",
                "implementation_locator": "db:sqlite://unused",
                "version": "1.0.0",
                "config": config
            }))
            .unwrap(),
        )
    }

    fn schema() -> ToolSchema {
        ToolSchema::compile(json!({ "type": "object" }), json!({})).unwrap()
    }

    #[tokio::test]
    async fn test_query_returns_rows_as_objects() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());

        let setup = SqlitePool::connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE filings (cik TEXT, form TEXT, amount REAL, pages INTEGER, raw BLOB)")
            .execute(&setup)
            .await
            .unwrap();
        sqlx::query("INSERT INTO filings VALUES ('0001', '10-K', 1.5, 120, x'0102'), ('0002', '8-K', NULL, 3, NULL)")
            .execute(&setup)
            .await
            .unwrap();
        setup.close().await;

        let tool = DbQueryTool::new(
            descriptor(json!({
                "query": "SELECT form, amount, pages, raw FROM filings WHERE cik = ?",
                "params": ["cik"]
            })),
            schema(),
            &url,
        )
        .unwrap();

        let args = json!({ "cik": "0001" }).as_object().cloned().unwrap();
        let out = tool.execute(args).await.unwrap();
        assert_eq!(out["count"], 1);
        let row = &out["rows"][0];
        assert_eq!(row["form"], "10-K");
        assert_eq!(row["amount"], 1.5);
        assert_eq!(row["pages"], 120);
        assert_eq!(row["raw"], "AQI=");
    }

    #[test]
    fn test_requires_query() {
        let err = DbQueryTool::new(descriptor(json!({})), schema(), "sqlite::memory:")
            .err()
            .unwrap();
        assert!(err.contains("config.query"));
    }

    #[test]
    fn test_placeholder_count_must_match_params() {
        let err = DbQueryTool::new(
            descriptor(json!({ "query": "SELECT ? + ?", "params": ["a"] })),
            schema(),
            "sqlite::memory:",
        )
        .err()
        .unwrap();
        assert!(err.contains("placeholders"));
    }
}
