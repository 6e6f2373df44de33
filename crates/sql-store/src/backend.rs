use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _};
use tracing::debug;

use crate::error::StoreResult;
use crate::value::{QueryResult, Row, Value};

/// Common interface over the embedded and remote SQL drivers.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult>;

    /// Run one statement per parameter set as a single unit. Returns total affected rows.
    async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64>;

    async fn close(&self);

    fn name(&self) -> &'static str;
}

/// sqlx `Any` pool; used for the local SQLite file and in-memory test databases.
pub struct SqlxBackend {
    pool: AnyPool,
}

impl SqlxBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Blob(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Statements whose result set we need to read back.
pub(crate) fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    head.starts_with("SELECT")
        || head.starts_with("WITH")
        || head.starts_with("PRAGMA")
        || head.contains(" RETURNING ")
        || head.ends_with(" RETURNING")
        || head.contains("\nRETURNING")
}

fn convert_row(row: &AnyRow) -> Row {
    let mut values = HashMap::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(Value::Integer).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(Value::Real).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(Value::Text).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            v.map(Value::Blob).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        values.insert(column.name().to_string(), value);
    }
    Row::new(values)
}

#[async_trait]
impl SqlBackend for SqlxBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
        let query = bind_params(sqlx::query(sql), params);
        if returns_rows(sql) {
            let rows = query.fetch_all(&self.pool).await?;
            let columns = rows
                .first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows: Vec<Row> = rows.iter().map(convert_row).collect();
            let rows_affected = rows.len() as u64;
            Ok(QueryResult {
                columns,
                rows,
                rows_affected,
            })
        } else {
            let result = query.execute(&self.pool).await?;
            Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: result.rows_affected(),
            })
        }
    }

    async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for params in batches {
            let result = bind_params(sqlx::query(sql), params)
                .execute(&mut *tx)
                .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        debug!("execute_many committed {} statements", batches.len());
        Ok(affected)
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn name(&self) -> &'static str {
        "sqlx"
    }
}
