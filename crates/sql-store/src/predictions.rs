use std::collections::HashMap;

use pipeline_core::{
    AccuracyStats, HistoricalPrediction, Prediction, Signal, ValidationStatus,
};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};
use crate::params;
use crate::value::{placeholders, Row, Value};

fn prediction_from_row(row: &Row) -> StoreResult<Prediction> {
    let raw_signal = row.text("signal")?;
    let signal = Signal::parse(&raw_signal)
        .ok_or_else(|| StoreError::column("signal", format!("unknown signal '{}'", raw_signal)))?;
    Ok(Prediction {
        symbol: row.text("symbol")?,
        date: row.text("date")?,
        model_id: row.text("model_id")?,
        target_date: row.text("target_date")?,
        signal,
        confidence: row.opt_real("confidence").unwrap_or(0.0),
        support_price: row.opt_real("support_price"),
        pressure_price: row.opt_real("pressure_price"),
        ai_reasoning: row.opt_text("ai_reasoning"),
        token_usage_input: row.opt_integer("token_usage_input").unwrap_or(0),
        token_usage_output: row.opt_integer("token_usage_output").unwrap_or(0),
        execution_time_ms: row.opt_integer("execution_time_ms").unwrap_or(0),
        validation_status: ValidationStatus::parse(
            &row.opt_text("validation_status").unwrap_or_default(),
        ),
        actual_change: row.opt_real("actual_change"),
        is_primary: row.flag("is_primary"),
        created_at: row.opt_text("created_at"),
        updated_at: row.opt_text("updated_at"),
    })
}

/// A row currently flagged primary, with its model's priority.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryHolder {
    pub model_id: String,
    pub priority: i64,
}

impl Store {
    /// Insert or refresh a prediction. Validation fields and `created_at`
    /// of an existing row are never touched here.
    pub async fn upsert_prediction(&self, p: &Prediction) -> StoreResult<()> {
        let now = self.now();
        self.execute(
            "INSERT INTO ai_predictions_v2 (
                symbol, date, model_id, target_date, signal, confidence,
                support_price, pressure_price, ai_reasoning,
                token_usage_input, token_usage_output, execution_time_ms,
                validation_status, is_primary, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'Pending', ?, ?, ?)
             ON CONFLICT(symbol, date, model_id) DO UPDATE SET
                target_date = excluded.target_date,
                signal = excluded.signal,
                confidence = excluded.confidence,
                support_price = excluded.support_price,
                pressure_price = excluded.pressure_price,
                ai_reasoning = excluded.ai_reasoning,
                token_usage_input = excluded.token_usage_input,
                token_usage_output = excluded.token_usage_output,
                execution_time_ms = excluded.execution_time_ms,
                is_primary = excluded.is_primary,
                updated_at = excluded.updated_at",
            &params![
                &p.symbol,
                &p.date,
                &p.model_id,
                &p.target_date,
                p.signal.as_str(),
                p.confidence,
                p.support_price,
                p.pressure_price,
                p.ai_reasoning.as_deref(),
                p.token_usage_input,
                p.token_usage_output,
                p.execution_time_ms,
                p.is_primary,
                now.clone(),
                now,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn prediction_exists(&self, symbol: &str, date: &str, model_id: &str) -> StoreResult<bool> {
        Ok(self
            .query_row(
                "SELECT 1 AS hit FROM ai_predictions_v2 WHERE symbol = ? AND date = ? AND model_id = ?",
                &params![symbol, date, model_id],
            )
            .await?
            .is_some())
    }

    pub async fn get_prediction(
        &self,
        symbol: &str,
        date: &str,
        model_id: &str,
    ) -> StoreResult<Option<Prediction>> {
        match self
            .query_row(
                "SELECT * FROM ai_predictions_v2 WHERE symbol = ? AND date = ? AND model_id = ?",
                &params![symbol, date, model_id],
            )
            .await?
        {
            Some(row) => Ok(Some(prediction_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn predictions_for(&self, symbol: &str, date: &str) -> StoreResult<Vec<Prediction>> {
        self.query(
            "SELECT * FROM ai_predictions_v2 WHERE symbol = ? AND date = ? ORDER BY model_id",
            &params![symbol, date],
        )
        .await?
        .iter()
        .map(prediction_from_row)
        .collect()
    }

    /// Rows flagged primary for (symbol, date), highest model priority first.
    /// More than one entry means the at-most-one-primary invariant is broken.
    pub async fn primary_holders(&self, symbol: &str, date: &str) -> StoreResult<Vec<PrimaryHolder>> {
        let rows = self
            .query(
                "SELECT p.model_id, COALESCE(m.priority, 0) AS priority
                 FROM ai_predictions_v2 p
                 LEFT JOIN prediction_models m ON m.model_id = p.model_id
                 WHERE p.symbol = ? AND p.date = ? AND p.is_primary = 1
                 ORDER BY priority DESC, m.rowid ASC",
                &params![symbol, date],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(PrimaryHolder {
                    model_id: r.text("model_id")?,
                    priority: r.opt_integer("priority").unwrap_or(0),
                })
            })
            .collect()
    }

    /// Clear `is_primary` on every (symbol, date) row except `keep_model_id`.
    pub async fn demote_primaries(&self, symbol: &str, date: &str, keep_model_id: &str) -> StoreResult<u64> {
        Ok(self
            .execute(
                "UPDATE ai_predictions_v2 SET is_primary = 0
                 WHERE symbol = ? AND date = ? AND model_id != ? AND is_primary = 1",
                &params![symbol, date, keep_model_id],
            )
            .await?
            .rows_affected)
    }

    pub async fn primary_prediction(&self, symbol: &str, date: &str) -> StoreResult<Option<Prediction>> {
        match self
            .query_row(
                "SELECT p.* FROM ai_predictions_v2 p
                 LEFT JOIN prediction_models m ON m.model_id = p.model_id
                 WHERE p.symbol = ? AND p.date = ? AND p.is_primary = 1
                 ORDER BY COALESCE(m.priority, 0) DESC LIMIT 1",
                &params![symbol, date],
            )
            .await?
        {
            Some(row) => Ok(Some(prediction_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Primary prediction per symbol on `date`.
    pub async fn primary_predictions_on(
        &self,
        symbols: &[String],
        date: &str,
    ) -> StoreResult<HashMap<String, Prediction>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT * FROM ai_predictions_v2 WHERE date = ? AND is_primary = 1 AND symbol IN ({})",
            placeholders(symbols.len())
        );
        let mut params = params![date];
        params.extend(symbols.iter().map(Value::from));
        let mut out = HashMap::new();
        for row in self.query(&sql, &params).await? {
            let p = prediction_from_row(&row)?;
            out.insert(p.symbol.clone(), p);
        }
        Ok(out)
    }

    /// Primary calls whose target is `target_date`, per symbol.
    pub async fn primary_predictions_targeting(
        &self,
        symbols: &[String],
        target_date: &str,
    ) -> StoreResult<HashMap<String, Prediction>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT * FROM ai_predictions_v2
             WHERE target_date = ? AND is_primary = 1 AND symbol IN ({})
             ORDER BY date",
            placeholders(symbols.len())
        );
        let mut params = params![target_date];
        params.extend(symbols.iter().map(Value::from));
        let mut out = HashMap::new();
        for row in self.query(&sql, &params).await? {
            let p = prediction_from_row(&row)?;
            out.insert(p.symbol.clone(), p);
        }
        Ok(out)
    }

    /// Validated track record before `before_date`. `model_id = None` selects
    /// primary rows only.
    pub async fn prediction_history(
        &self,
        symbol: &str,
        model_id: Option<&str>,
        before_date: &str,
        limit: usize,
    ) -> StoreResult<Vec<HistoricalPrediction>> {
        let (filter, mut params) = history_filter(symbol, model_id, before_date);
        let sql = format!(
            "SELECT date, target_date, model_id, signal, confidence, validation_status, actual_change
             FROM ai_predictions_v2 WHERE {} ORDER BY date DESC LIMIT ?",
            filter
        );
        params.push(Value::from(limit));
        let mut out = Vec::new();
        for row in self.query(&sql, &params).await? {
            let raw = row.text("signal")?;
            let Some(signal) = Signal::parse(&raw) else {
                continue;
            };
            out.push(HistoricalPrediction {
                date: row.text("date")?,
                target_date: row.text("target_date")?,
                model_id: row.text("model_id")?,
                signal,
                confidence: row.opt_real("confidence").unwrap_or(0.0),
                validation_status: ValidationStatus::parse(&row.text("validation_status")?),
                actual_change: row.opt_real("actual_change"),
            });
        }
        Ok(out)
    }

    pub async fn prediction_accuracy(
        &self,
        symbol: &str,
        model_id: Option<&str>,
        before_date: &str,
    ) -> StoreResult<AccuracyStats> {
        let (filter, params) = history_filter(symbol, model_id, before_date);
        let sql = format!(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN validation_status = 'Correct' THEN 1 ELSE 0 END) AS correct
             FROM ai_predictions_v2 WHERE {}",
            filter
        );
        let row = self.query_row(&sql, &params).await?;
        let (total, correct) = row
            .map(|r| {
                (
                    r.opt_integer("total").unwrap_or(0),
                    r.opt_integer("correct").unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));
        Ok(AccuracyStats::new(total, correct))
    }

    /// Pending rows of every model that target `target_date`.
    pub async fn pending_for_target(&self, symbol: &str, target_date: &str) -> StoreResult<Vec<Prediction>> {
        self.query(
            "SELECT * FROM ai_predictions_v2
             WHERE symbol = ? AND target_date = ? AND validation_status = 'Pending'",
            &params![symbol, target_date],
        )
        .await?
        .iter()
        .map(prediction_from_row)
        .collect()
    }

    pub async fn symbols_pending_for_target(&self, target_date: &str) -> StoreResult<Vec<String>> {
        self.query(
            "SELECT DISTINCT symbol FROM ai_predictions_v2
             WHERE target_date = ? AND validation_status = 'Pending' ORDER BY symbol",
            &params![target_date],
        )
        .await?
        .iter()
        .map(|r| r.text("symbol"))
        .collect()
    }

    /// One-way Pending → Correct|Incorrect. Returns false if the row was
    /// already adjudicated.
    pub async fn apply_validation(
        &self,
        p: &Prediction,
        status: ValidationStatus,
        actual_change: f64,
    ) -> StoreResult<bool> {
        if status == ValidationStatus::Pending {
            return Ok(false);
        }
        let result = self
            .execute(
                "UPDATE ai_predictions_v2
                 SET validation_status = ?, actual_change = ?, updated_at = ?
                 WHERE symbol = ? AND date = ? AND model_id = ? AND validation_status = 'Pending'",
                &params![
                    status.as_str(),
                    actual_change,
                    self.now(),
                    &p.symbol,
                    &p.date,
                    &p.model_id,
                ],
            )
            .await?;
        Ok(result.rows_affected > 0)
    }
}

fn history_filter(symbol: &str, model_id: Option<&str>, before_date: &str) -> (String, Vec<Value>) {
    let base = "symbol = ? AND validation_status != 'Pending' AND date < ?";
    match model_id {
        Some(id) => (
            format!("{} AND model_id = ?", base),
            params![symbol, before_date, id],
        ),
        None => (
            format!("{} AND is_primary = 1", base),
            params![symbol, before_date],
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::tests::model;

    pub(crate) fn prediction(symbol: &str, date: &str, model_id: &str, signal: Signal) -> Prediction {
        Prediction {
            symbol: symbol.to_string(),
            date: date.to_string(),
            model_id: model_id.to_string(),
            target_date: "2026-01-05".to_string(),
            signal,
            confidence: 0.8,
            support_price: Some(9.5),
            pressure_price: None,
            ai_reasoning: Some(format!("{{\"signal\":\"{}\"}}", signal)),
            token_usage_input: 10,
            token_usage_output: 5,
            execution_time_ms: 100,
            validation_status: ValidationStatus::Pending,
            actual_change: None,
            is_primary: false,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_validation_fields() {
        let store = Store::in_memory().await.unwrap();
        let p = prediction("X", "2026-01-02", "m1", Signal::Long);
        store.upsert_prediction(&p).await.unwrap();
        assert!(store
            .apply_validation(&p, ValidationStatus::Correct, 1.2)
            .await
            .unwrap());
        // Second adjudication is a no-op.
        assert!(!store
            .apply_validation(&p, ValidationStatus::Incorrect, -3.0)
            .await
            .unwrap());

        let mut again = p.clone();
        again.signal = Signal::Short;
        store.upsert_prediction(&again).await.unwrap();
        let stored = store.get_prediction("X", "2026-01-02", "m1").await.unwrap().unwrap();
        assert_eq!(stored.signal, Signal::Short);
        assert_eq!(stored.validation_status, ValidationStatus::Correct);
        assert_eq!(stored.actual_change, Some(1.2));
        assert!(store.pending_for_target("X", "2026-01-05").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn primary_holders_and_demotion() {
        let store = Store::in_memory().await.unwrap();
        store.register_model(&model("hi", 100)).await.unwrap();
        store.register_model(&model("lo", 50)).await.unwrap();
        for id in ["hi", "lo"] {
            let mut p = prediction("X", "2026-01-02", id, Signal::Side);
            p.is_primary = true;
            store.upsert_prediction(&p).await.unwrap();
        }
        let holders = store.primary_holders("X", "2026-01-02").await.unwrap();
        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].model_id, "hi");

        assert_eq!(store.demote_primaries("X", "2026-01-02", "hi").await.unwrap(), 1);
        let primary = store.primary_prediction("X", "2026-01-02").await.unwrap().unwrap();
        assert_eq!(primary.model_id, "hi");
        assert_eq!(store.primary_holders("X", "2026-01-02").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_filters_by_model_or_primary() {
        let store = Store::in_memory().await.unwrap();
        for (date, model_id, primary, status) in [
            ("2025-12-29", "m1", true, ValidationStatus::Correct),
            ("2025-12-30", "m1", true, ValidationStatus::Incorrect),
            ("2025-12-30", "m2", false, ValidationStatus::Correct),
            ("2025-12-31", "m1", true, ValidationStatus::Pending),
            ("2026-01-02", "m1", true, ValidationStatus::Correct),
        ] {
            let mut p = prediction("X", date, model_id, Signal::Long);
            p.is_primary = primary;
            store.upsert_prediction(&p).await.unwrap();
            if status != ValidationStatus::Pending {
                store.apply_validation(&p, status, 0.5).await.unwrap();
            }
        }

        let primary = store
            .prediction_history("X", None, "2026-01-02", 5)
            .await
            .unwrap();
        assert_eq!(primary.len(), 2);
        assert_eq!(primary[0].date, "2025-12-30");
        let acc = store.prediction_accuracy("X", None, "2026-01-02").await.unwrap();
        assert_eq!((acc.total, acc.correct), (2, 1));
        assert_eq!(acc.accuracy_pct, 50.0);

        let m2 = store
            .prediction_history("X", Some("m2"), "2026-01-02", 5)
            .await
            .unwrap();
        assert_eq!(m2.len(), 1);
        assert_eq!(m2[0].model_id, "m2");
    }

    #[tokio::test]
    async fn primaries_by_target_date() {
        let store = Store::in_memory().await.unwrap();
        let mut primary = prediction("X", "2026-01-02", "m1", Signal::Long);
        primary.is_primary = true;
        store.upsert_prediction(&primary).await.unwrap();
        store.upsert_prediction(&prediction("X", "2026-01-02", "m2", Signal::Short)).await.unwrap();
        let mut other = prediction("Y", "2026-01-05", "m1", Signal::Short);
        other.target_date = "2026-01-06".into();
        other.is_primary = true;
        store.upsert_prediction(&other).await.unwrap();

        let symbols = vec!["X".to_string(), "Y".to_string()];
        let calls = store.primary_predictions_targeting(&symbols, "2026-01-05").await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls["X"].model_id, "m1");
    }
}
