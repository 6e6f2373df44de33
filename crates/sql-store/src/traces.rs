use pipeline_core::{ChainTrace, StepDetail, TraceStatus};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::Row;

fn trace_from_row(row: &Row) -> StoreResult<ChainTrace> {
    let steps_executed: Vec<String> = row
        .json("steps_executed")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let steps_details: Vec<StepDetail> = row
        .json("steps_details")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let artifacts = match row.json("chain_artifacts") {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    Ok(ChainTrace {
        trace_id: row.text("trace_id")?,
        symbol: row.text("symbol")?,
        date: row.text("date")?,
        model_id: row.text("model_id")?,
        strategy_name: row.text("strategy_name")?,
        steps_executed,
        steps_details,
        artifacts,
        total_duration_ms: row.opt_integer("total_duration_ms").unwrap_or(0) as u64,
        total_tokens: row.opt_integer("total_tokens").unwrap_or(0) as u64,
        retry_count: row.opt_integer("retry_count").unwrap_or(0) as u32,
        final_result: row.json("final_result"),
        status: match row.opt_text("status").as_deref() {
            Some("success") => TraceStatus::Success,
            _ => TraceStatus::Failed,
        },
        error_step: row.opt_text("error_step"),
        error_reason: row.opt_text("error_reason"),
    })
}

impl Store {
    pub async fn insert_trace(&self, trace: &ChainTrace) -> StoreResult<()> {
        self.execute(
            "INSERT INTO chain_execution_traces (
                trace_id, symbol, date, model_id, strategy_name,
                steps_executed, steps_details, chain_artifacts,
                total_duration_ms, total_tokens, retry_count,
                final_result, status, error_step, error_reason, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &params![
                &trace.trace_id,
                &trace.symbol,
                &trace.date,
                &trace.model_id,
                &trace.strategy_name,
                serde_json::to_string(&trace.steps_executed)?,
                serde_json::to_string(&trace.steps_details)?,
                serde_json::to_string(&trace.artifacts)?,
                trace.total_duration_ms,
                trace.total_tokens,
                trace.retry_count,
                trace.final_result.as_ref(),
                trace.status.as_str(),
                trace.error_step.as_deref(),
                trace.error_reason.as_deref(),
                self.now(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_trace(&self, trace_id: &str) -> StoreResult<Option<ChainTrace>> {
        match self
            .query_row(
                "SELECT * FROM chain_execution_traces WHERE trace_id = ?",
                &params![trace_id],
            )
            .await?
        {
            Some(row) => Ok(Some(trace_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn traces_for(&self, symbol: &str, date: &str) -> StoreResult<Vec<ChainTrace>> {
        self.query(
            "SELECT * FROM chain_execution_traces WHERE symbol = ? AND date = ? ORDER BY created_at, rowid",
            &params![symbol, date],
        )
        .await?
        .iter()
        .map(trace_from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn trace_roundtrip() {
        let store = Store::in_memory().await.unwrap();
        let mut artifacts = serde_json::Map::new();
        artifacts.insert("anchor".into(), json!("数据已确认"));
        let trace = ChainTrace {
            trace_id: "t-1".into(),
            symbol: "00700".into(),
            date: "2026-01-02".into(),
            model_id: "chain-a".into(),
            strategy_name: "four_step".into(),
            steps_executed: vec!["anchor".into()],
            steps_details: vec![StepDetail {
                step: "anchor".into(),
                duration_ms: 12,
                tokens: 40,
                attempts: 1,
                prompt_preview: "p".into(),
                output_preview: "o".into(),
            }],
            artifacts,
            total_duration_ms: 12,
            total_tokens: 40,
            retry_count: 0,
            final_result: None,
            status: TraceStatus::Failed,
            error_step: Some("indicator".into()),
            error_reason: Some("timeout".into()),
        };
        store.insert_trace(&trace).await.unwrap();
        let loaded = store.get_trace("t-1").await.unwrap().unwrap();
        assert_eq!(loaded, trace);
        assert_eq!(store.traces_for("00700", "2026-01-02").await.unwrap().len(), 1);
    }
}
