use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{DbSource, MarketClock, PipelineConfig};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};

use crate::backend::{SqlBackend, SqlxBackend};
use crate::error::{StoreError, StoreResult};
use crate::http::HttpSqlBackend;
use crate::value::{QueryResult, Row, Value};

/// Upper bound on rows per multi-row INSERT.
pub const MAX_BATCH_ROWS: usize = 500;

const SCHEMA: &str = include_str!("../../../schema.sql");

/// Retrying facade over a [`SqlBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn SqlBackend>,
    clock: MarketClock,
    max_retries: usize,
}

impl Store {
    pub fn new(backend: Arc<dyn SqlBackend>, clock: MarketClock) -> Self {
        Self {
            backend,
            clock,
            max_retries: 3,
        }
    }

    /// Open the backend selected by `DB_SOURCE` and bootstrap the schema.
    pub async fn connect(config: &PipelineConfig) -> StoreResult<Self> {
        let backend: Arc<dyn SqlBackend> = match config.db_source {
            DbSource::Local => Arc::new(SqlxBackend::connect(&config.database_url, 5).await?),
            DbSource::Cloud => {
                let url = config.cloud_db_url.as_deref().ok_or_else(|| {
                    StoreError::Fatal("CLOUD_DB_URL is required for DB_SOURCE=cloud".to_string())
                })?;
                Arc::new(HttpSqlBackend::new(url, config.cloud_db_token.clone())?)
            }
        };
        let store = Self::new(backend, config.clock());
        store.init_schema().await?;
        info!("Store ready on {} backend", store.backend.name());
        Ok(store)
    }

    /// Single-connection in-memory SQLite with the full schema. Used by tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let backend = SqlxBackend::connect("sqlite::memory:", 1).await?;
        let store = Self::new(Arc::new(backend), MarketClock::default());
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        // Split by statement since the drivers take one statement per call
        for statement in SCHEMA.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                self.backend.execute(stmt, &[]).await?;
            }
        }
        Ok(())
    }

    pub fn clock(&self) -> &MarketClock {
        &self.clock
    }

    pub fn now(&self) -> String {
        self.clock.now_string()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(strategy, || op(), |e: &StoreError| {
            if e.is_transient() {
                warn!("Retryable storage error during {}: {}", what, e);
                true
            } else {
                false
            }
        })
        .await
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
        self.with_retry("execute", || self.backend.execute(sql, params))
            .await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        Ok(self.execute(sql, params).await?.rows)
    }

    pub async fn query_row(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>> {
        Ok(self.execute(sql, params).await?.rows.into_iter().next())
    }

    pub async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64> {
        if batches.is_empty() {
            return Ok(0);
        }
        self.with_retry("execute_many", || self.backend.execute_many(sql, batches))
            .await
    }

    /// Multi-row `INSERT` in chunks of at most [`MAX_BATCH_ROWS`].
    ///
    /// `conflict` is appended verbatim, e.g. `ON CONFLICT(symbol, date) DO UPDATE SET ...`.
    pub async fn insert_batch(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
        conflict: &str,
    ) -> StoreResult<u64> {
        let mut affected = 0;
        let row_slot = format!("({})", vec!["?"; columns.len()].join(", "));

        for chunk in rows.chunks(MAX_BATCH_ROWS) {
            let mut params = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                if row.len() != columns.len() {
                    return Err(StoreError::Fatal(format!(
                        "insert_batch into {}: row has {} values, expected {}",
                        table,
                        row.len(),
                        columns.len()
                    )));
                }
                params.extend(row.iter().cloned());
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {} {}",
                table,
                columns.join(", "),
                vec![row_slot.as_str(); chunk.len()].join(", "),
                conflict
            );
            affected += self.execute(&sql, &params).await?.rows_affected;
        }
        Ok(affected)
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBackend {
        calls: AtomicUsize,
        fail_times: usize,
        transient: bool,
    }

    #[async_trait]
    impl SqlBackend for FlakyBackend {
        async fn execute(&self, _sql: &str, _params: &[Value]) -> StoreResult<QueryResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                if self.transient {
                    Err(StoreError::Transient("database is locked".into()))
                } else {
                    Err(StoreError::Fatal("no such table".into()))
                }
            } else {
                Ok(QueryResult::default())
            }
        }

        async fn execute_many(&self, _sql: &str, _batches: &[Vec<Value>]) -> StoreResult<u64> {
            Ok(0)
        }

        async fn close(&self) {}

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn flaky(fail_times: usize, transient: bool) -> (Arc<FlakyBackend>, Store) {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
            fail_times,
            transient,
        });
        let store = Store::new(backend.clone(), MarketClock::default());
        (backend, store)
    }

    #[tokio::test]
    async fn retries_transient_errors_three_times() {
        let (backend, store) = flaky(3, true);
        assert!(store.execute("SELECT 1", &[]).await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);

        let (backend, store) = flaky(4, true);
        assert!(store.execute("SELECT 1", &[]).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let (backend, store) = flaky(1, false);
        assert!(store.execute("SELECT 1", &[]).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insert_batch_chunks_large_inputs() {
        let store = Store::in_memory().await.unwrap();
        store
            .execute("CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        let rows: Vec<Vec<Value>> = (0..1203)
            .map(|i| vec![Value::Integer(i), Value::Text(format!("v{}", i))])
            .collect();
        let affected = store
            .insert_batch("t", &["k", "v"], &rows, "ON CONFLICT(k) DO NOTHING")
            .await
            .unwrap();
        assert_eq!(affected, 1203);
        let count = store
            .query_row("SELECT COUNT(*) AS n FROM t", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count.integer("n").unwrap(), 1203);
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let tables = store
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'ai_predictions_v2'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
    }
}
