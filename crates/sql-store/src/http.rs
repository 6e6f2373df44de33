//! libSQL remote backend speaking the `/v2/pipeline` JSON protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::backend::SqlBackend;
use crate::error::{StoreError, StoreResult};
use crate::value::{QueryResult, Row, Value};

pub struct HttpSqlBackend {
    client: reqwest::Client,
    pipeline_url: String,
    token: Option<String>,
}

impl HttpSqlBackend {
    pub fn new(url: &str, token: Option<String>) -> StoreResult<Self> {
        let base = url
            .trim()
            .trim_end_matches('/')
            .replacen("libsql://", "https://", 1);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Fatal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            pipeline_url: format!("{}/v2/pipeline", base),
            token,
        })
    }

    async fn pipeline(&self, statements: Vec<Json>) -> StoreResult<Vec<Json>> {
        let count = statements.len();
        let mut requests: Vec<Json> = statements
            .into_iter()
            .map(|stmt| json!({ "type": "execute", "stmt": stmt }))
            .collect();
        requests.push(json!({ "type": "close" }));

        let mut req = self
            .client
            .post(&self.pipeline_url)
            .json(&json!({ "requests": requests }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("libsql pipeline returned {}: {}", status, body);
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    StoreError::Transient(msg)
                } else {
                    StoreError::Fatal(msg)
                },
            );
        }

        let body: Json = response.json().await?;
        let results = body
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| StoreError::Fatal("libsql response missing results".to_string()))?;

        let mut out = Vec::with_capacity(count);
        for item in results.iter().take(count) {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("ok") => {
                    let result = item
                        .pointer("/response/result")
                        .cloned()
                        .unwrap_or(Json::Null);
                    out.push(result);
                }
                _ => {
                    let message = item
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown libsql error");
                    let lower = message.to_ascii_lowercase();
                    return Err(if lower.contains("locked") || lower.contains("busy") {
                        StoreError::Transient(message.to_string())
                    } else {
                        StoreError::Fatal(message.to_string())
                    });
                }
            }
        }
        Ok(out)
    }
}

fn encode_param(value: &Value) -> StoreResult<Json> {
    Ok(match value {
        Value::Null => json!({ "type": "null" }),
        // Integers travel as strings to survive JSON number precision.
        Value::Integer(i) => json!({ "type": "integer", "value": i.to_string() }),
        Value::Real(f) => json!({ "type": "float", "value": f }),
        Value::Text(s) => json!({ "type": "text", "value": s }),
        Value::Blob(_) => {
            return Err(StoreError::Fatal(
                "blob parameters are not supported by the remote backend".to_string(),
            ))
        }
    })
}

fn statement(sql: &str, params: &[Value]) -> StoreResult<Json> {
    let args = params.iter().map(encode_param).collect::<StoreResult<Vec<_>>>()?;
    Ok(json!({ "sql": sql, "args": args }))
}

fn decode_cell(cell: &Json) -> Value {
    let kind = cell.get("type").and_then(|t| t.as_str()).unwrap_or("null");
    let raw = cell.get("value");
    match kind {
        "integer" => raw
            .and_then(|v| match v {
                Json::String(s) => s.parse().ok(),
                Json::Number(n) => n.as_i64(),
                _ => None,
            })
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        "float" => raw
            .and_then(|v| v.as_f64())
            .map(Value::Real)
            .unwrap_or(Value::Null),
        "text" => raw
            .and_then(|v| v.as_str())
            .map(|s| Value::Text(s.to_string()))
            .unwrap_or(Value::Null),
        // Blobs come back base64-encoded; callers only ever read them as text.
        "blob" => cell
            .get("base64")
            .and_then(|v| v.as_str())
            .map(|s| Value::Text(s.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub(crate) fn decode_result(result: &Json) -> QueryResult {
    let columns: Vec<String> = result
        .get("cols")
        .and_then(|c| c.as_array())
        .map(|cols| {
            cols.iter()
                .map(|c| {
                    c.get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string()
                })
                .collect()
        })
        .unwrap_or_default();

    let rows = result
        .get("rows")
        .and_then(|r| r.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.as_array())
                .map(|cells| {
                    let values: HashMap<String, Value> = columns
                        .iter()
                        .cloned()
                        .zip(cells.iter().map(decode_cell))
                        .collect();
                    Row::new(values)
                })
                .collect()
        })
        .unwrap_or_default();

    let rows_affected = result
        .get("affected_row_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    QueryResult {
        columns,
        rows,
        rows_affected,
    }
}

#[async_trait]
impl SqlBackend for HttpSqlBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
        let results = self.pipeline(vec![statement(sql, params)?]).await?;
        Ok(results.first().map(decode_result).unwrap_or_default())
    }

    async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64> {
        let mut statements = Vec::with_capacity(batches.len() + 2);
        statements.push(json!({ "sql": "BEGIN" }));
        for params in batches {
            statements.push(statement(sql, params)?);
        }
        statements.push(json!({ "sql": "COMMIT" }));

        let results = self.pipeline(statements).await?;
        let affected = results.iter().map(|r| decode_result(r).rows_affected).sum();
        debug!("remote execute_many committed {} statements", batches.len());
        Ok(affected)
    }

    async fn close(&self) {}

    fn name(&self) -> &'static str {
        "libsql-http"
    }
}
