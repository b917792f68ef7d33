use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::http::HttpResponse;
use crate::error::EngineError;

/// Pools keyed by connection string, created lazily and shared for the
/// process lifetime. A connection is acquired per query and released when
/// the query returns.
pub struct PostgresCaller {
    pools: Mutex<HashMap<String, PgPool>>,
}

impl Default for PostgresCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresCaller {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Runs a parameterized query and mirrors the HTTP caller's return
    /// shape: rows come back as a JSON array under `data` with status 200.
    pub async fn execute(
        &self,
        connection: &str,
        statement: &SqlStatement,
        timeout: Duration,
    ) -> Result<HttpResponse, EngineError> {
        let pool = self.pool_for(connection).await?;

        let mut query = sqlx::query(&statement.query);
        for param in &statement.params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or_default())
                    }
                }
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.clone()),
            };
        }

        debug!(query = %statement.query, params = statement.params.len(), "executing sql");

        let rows = tokio::time::timeout(timeout, query.fetch_all(&pool))
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
            .map_err(|e| EngineError::Postgres(e.to_string()))?;

        let data = Value::Array(rows.iter().map(row_to_json).collect());

        Ok(HttpResponse {
            status: 200,
            status_text: "OK".to_string(),
            data,
            headers: HashMap::new(),
        })
    }

    async fn pool_for(&self, connection: &str) -> Result<PgPool, EngineError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(connection) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection)
            .await
            .map_err(|e| EngineError::Postgres(e.to_string()))?;
        pools.insert(connection.to_string(), pool.clone());
        Ok(pool)
    }
}

/// The statement carried in an ApiConfig body for `postgres://` endpoints:
/// `{"query": "SELECT ...", "params": [...]}`, or a bare SQL string.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub query: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    pub fn from_body(body: &str) -> Result<Self, EngineError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Postgres(
                "postgres call requires a body with a query".to_string(),
            ));
        }

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            let query = map
                .get("query")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Postgres("body is missing `query`".to_string()))?
                .to_string();
            let params = map
                .get("params")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            return Ok(SqlStatement { query, params });
        }

        Ok(SqlStatement {
            query: trimmed.to_string(),
            params: Vec::new(),
        })
    }
}

pub fn is_postgres_url(url: &str) -> bool {
    let lower = url.trim_start().to_lowercase();
    lower.starts_with("postgres://") || lower.starts_with("postgresql://")
}

fn row_to_json(row: &PgRow) -> Value {
    let mut out = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_to_json(row, i, column));
    }
    Value::Object(out)
}

fn column_to_json(row: &PgRow, index: usize, column: &sqlx::postgres::PgColumn) -> Value {
    match column.type_info().name() {
        "INT2" | "INT4" | "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(|f| serde_json::json!(f))
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<OffsetDateTime>, _>(index)
            .ok()
            .flatten()
            .and_then(|t| t.format(&Rfc3339).ok())
            .map(Value::from)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}
