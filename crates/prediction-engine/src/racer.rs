//! Runs every active model for one (symbol, date), applies the circuit
//! breaker, elects the primary row and persists the results.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use pipeline_core::{
    AnalysisContext, PipelineError, PipelineResult, Prediction, PredictionModel, SkipReason,
    TradingCalendar, ValidationStatus,
};
use reasoning_chain::apply_circuit_breaker;
use sql_store::{PrimaryHolder, Store};
use tokio::sync::{Mutex, Semaphore};

use crate::adapter::{AdapterOutcome, AdapterOutput};
use crate::context::ContextBuilder;
use crate::resolver::AdapterResolver;

/// What one race did.
#[derive(Debug, Clone, Default)]
pub struct RaceReport {
    pub symbol: String,
    pub date: String,
    /// Model ids written this run, priority order.
    pub saved: Vec<String>,
    /// Models that already had a row and were left alone.
    pub skipped_existing: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<(String, String)>,
    /// Model elected primary by this run, if primacy moved or was kept.
    pub elected: Option<String>,
    /// The primary row for (symbol, date) after the race.
    pub primary: Option<Prediction>,
}

impl RaceReport {
    fn new(symbol: &str, date: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            date: date.to_string(),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.saved.is_empty()
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Completed(RaceReport),
    DataMissing(String),
    Failed(String),
}

struct RaceResult {
    model: PredictionModel,
    output: AdapterOutput,
}

pub struct PredictionRacer {
    store: Store,
    contexts: Arc<ContextBuilder>,
    resolver: AdapterResolver,
    calendar: Arc<dyn TradingCalendar>,
    model_filter: Option<Vec<String>>,
    election_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl PredictionRacer {
    pub fn new(
        store: Store,
        contexts: Arc<ContextBuilder>,
        resolver: AdapterResolver,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Self {
        Self {
            store,
            contexts,
            resolver,
            calendar,
            model_filter: None,
            election_locks: DashMap::new(),
        }
    }

    pub fn with_model_filter(mut self, filter: Option<Vec<String>>) -> Self {
        self.model_filter = filter.filter(|f| !f.is_empty());
        self
    }

    async fn models(&self) -> PipelineResult<Vec<PredictionModel>> {
        let mut models = self.store.active_models().await?;
        if let Some(filter) = &self.model_filter {
            models.retain(|m| filter.contains(&m.model_id));
        }
        Ok(models)
    }

    fn election_lock(&self, symbol: &str, date: &str) -> Arc<Mutex<()>> {
        self.election_locks
            .entry((symbol.to_string(), date.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn run_analysis(
        &self,
        symbol: &str,
        date: Option<&str>,
        context: Option<AnalysisContext>,
        force: bool,
    ) -> PipelineResult<RaceReport> {
        let models = self.models().await?;
        let base = match context {
            Some(ctx) => ctx,
            None => self.contexts.build(symbol, date, None).await?,
        };
        let date = date.unwrap_or(&base.analysis_date).to_string();
        let mut report = RaceReport::new(symbol, &date);

        if models.is_empty() {
            tracing::warn!(symbol, date = %date, "no active prediction models");
            return Ok(report);
        }

        let mut contenders = Vec::with_capacity(models.len());
        for model in models {
            if !force && self.store.prediction_exists(symbol, &date, &model.model_id).await? {
                tracing::debug!(symbol, date = %date, model_id = %model.model_id, "prediction exists, skipping");
                report.skipped_existing.push(model.model_id);
                continue;
            }
            let prepared = match self.resolver.resolve(&model) {
                Ok(adapter) => self
                    .contexts
                    .for_model(&base, &model.model_id)
                    .await
                    .map(|ctx| (adapter, ctx)),
                Err(e) => Err(e),
            };
            match prepared {
                Ok((adapter, ctx)) => contenders.push((model, adapter, ctx)),
                Err(e) => {
                    tracing::warn!(symbol, date = %date, model_id = %model.model_id, "could not prepare model: {}", e);
                    report.failed.push((model.model_id, e.to_string()));
                }
            }
        }

        let runs = contenders.iter().map(|(model, adapter, ctx)| {
            let date = date.as_str();
            async move { (model, adapter.predict(symbol, date, ctx).await) }
        });

        let mut results = Vec::new();
        for (model, outcome) in join_all(runs).await {
            match outcome {
                Ok(AdapterOutcome::Prediction(mut output)) => {
                    if apply_circuit_breaker(&mut output.payload) {
                        tracing::info!(symbol, model_id = %model.model_id, "low-confidence call downgraded to Side");
                    }
                    results.push(RaceResult {
                        model: model.clone(),
                        output,
                    });
                }
                Ok(AdapterOutcome::Skip(reason)) => {
                    tracing::info!(symbol, model_id = %model.model_id, "skipped: {}", reason);
                    report.skipped.push((model.model_id.clone(), reason));
                }
                Err(e) => {
                    tracing::warn!(symbol, date = %date, model_id = %model.model_id, "prediction failed: {}", e);
                    report.failed.push((model.model_id.clone(), e.to_string()));
                }
            }
        }

        if results.is_empty() {
            tracing::info!(
                symbol,
                date = %date,
                skipped_existing = report.skipped_existing.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "race produced no new predictions"
            );
            report.primary = self.store.primary_prediction(symbol, &date).await?;
            return Ok(report);
        }

        let target_date = self
            .calendar
            .next_trading_date(self.store.market_of(symbol).await?, &date)?;

        let lock = self.election_lock(symbol, &date);
        let _guard = lock.lock().await;

        let holder = self.current_primary(symbol, &date).await?;
        let winner = elect(&results, holder.as_ref());
        if let Some(winner) = &winner {
            self.store.demote_primaries(symbol, &date, winner).await?;
        }

        for result in &results {
            let is_primary = winner.as_deref() == Some(result.model.model_id.as_str());
            let row = to_row(symbol, &date, &target_date, result, is_primary);
            self.store.upsert_prediction(&row).await?;
            report.saved.push(result.model.model_id.clone());
        }
        report.elected = winner;
        report.primary = self.store.primary_prediction(symbol, &date).await?;

        tracing::info!(
            symbol,
            date = %date,
            saved = report.saved.len(),
            failed = report.failed.len(),
            primary = report.primary.as_ref().map(|p| p.model_id.as_str()).unwrap_or("-"),
            "race complete"
        );
        Ok(report)
    }

    /// The stored primary, repairing duplicates down to the highest-priority one.
    async fn current_primary(&self, symbol: &str, date: &str) -> PipelineResult<Option<PrimaryHolder>> {
        let holders = self.store.primary_holders(symbol, date).await?;
        let Some(keep) = holders.first().cloned() else {
            return Ok(None);
        };
        if holders.len() > 1 {
            tracing::warn!(
                symbol,
                date,
                holders = holders.len(),
                keep = %keep.model_id,
                "duplicate primary predictions, repairing"
            );
            self.store.demote_primaries(symbol, date, &keep.model_id).await?;
        }
        Ok(Some(keep))
    }

    /// Race many symbols with at most `concurrency` in flight.
    pub async fn run_batch(
        self: &Arc<Self>,
        symbols: &[String],
        date: Option<&str>,
        force: bool,
        concurrency: usize,
    ) -> Vec<(String, BatchOutcome)> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let racer = Arc::clone(self);
            let semaphore = semaphore.clone();
            let symbol = symbol.clone();
            let date = date.map(str::to_string);
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (symbol, BatchOutcome::Failed(e.to_string())),
                };
                let outcome = match racer.run_analysis(&symbol, date.as_deref(), None, force).await {
                    Ok(report) => BatchOutcome::Completed(report),
                    Err(PipelineError::DataMissing(reason)) => {
                        tracing::info!(symbol = %symbol, "skipped: {}", reason);
                        BatchOutcome::DataMissing(reason)
                    }
                    Err(e) => {
                        tracing::error!(symbol = %symbol, "race failed: {}", e);
                        BatchOutcome::Failed(e.to_string())
                    }
                };
                (symbol, outcome)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (symbol, handle) in symbols.iter().zip(handles) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(symbol = %symbol, "race task panicked: {}", e);
                    outcomes.push((symbol.clone(), BatchOutcome::Failed(e.to_string())));
                }
            }
        }
        outcomes
    }
}

/// First result, in priority order, that may take primacy: its priority is
/// at least the holder's, or it is the holder re-running.
fn elect(results: &[RaceResult], holder: Option<&PrimaryHolder>) -> Option<String> {
    results
        .iter()
        .find(|r| match holder {
            None => true,
            Some(h) => r.model.priority >= h.priority || r.model.model_id == h.model_id,
        })
        .map(|r| r.model.model_id.clone())
}

fn to_row(
    symbol: &str,
    date: &str,
    target_date: &str,
    result: &RaceResult,
    is_primary: bool,
) -> Prediction {
    let payload = &result.output.payload;
    Prediction {
        symbol: symbol.to_string(),
        date: date.to_string(),
        model_id: result.model.model_id.clone(),
        target_date: target_date.to_string(),
        signal: payload.signal,
        confidence: payload.confidence,
        support_price: payload.support_price(),
        pressure_price: payload.pressure_price(),
        ai_reasoning: Some(payload.to_json_string()),
        token_usage_input: result.output.tokens_in as i64,
        token_usage_output: result.output.tokens_out as i64,
        execution_time_ms: result.output.execution_ms as i64,
        validation_status: ValidationStatus::Pending,
        actual_change: None,
        is_primary,
        created_at: None,
        updated_at: None,
    }
}
