//! Fixtures and fake adapters for this crate's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_core::{
    AccuracyStats, AnalysisContext, Candle, Indicators, Market, MarketClock, Period, PipelineError,
    PipelineResult, Prediction, PredictionModel, PredictionPayload, Signal, ValidationStatus,
};
use serde_json::json;
use sql_store::{QueryResult, SqlBackend, SqlxBackend, Store, StoreError, StoreResult, Value};

use crate::adapter::{AdapterOutcome, AdapterOutput, PredictionAdapter};

pub(crate) fn candle(symbol: &str, date: &str, close: f64, change: f64, indicators: Indicators) -> Candle {
    Candle {
        symbol: symbol.into(),
        date: date.into(),
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 2_000_000.0,
        change_percent: change,
        indicators,
    }
}

/// `n` consecutive January days of a steady uptrend, oldest first.
pub(crate) fn uptrend(symbol: &str, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 100.0 + i as f64;
            candle(
                symbol,
                &format!("2026-01-{:02}", i + 1),
                close,
                1.0,
                Indicators {
                    ma5: close - 1.0,
                    ma10: close - 2.0,
                    ma20: close - 4.0,
                    ma60: close - 8.0,
                    macd: 0.5,
                    macd_signal: 0.4,
                    macd_hist: 0.1,
                    boll_upper: close + 5.0,
                    boll_mid: close,
                    boll_lower: close - 5.0,
                    rsi: 60.0,
                    kdj_k: 60.0,
                    kdj_d: 55.0,
                    kdj_j: 70.0,
                },
            )
        })
        .collect()
}

pub(crate) async fn seed_candles(store: &Store, symbol: &str, n: usize) {
    let candles = uptrend(symbol, n);
    store.upsert_candles(Period::Daily, &candles).await.unwrap();
    store
        .upsert_candles(Period::Weekly, &candles[..n.min(2)])
        .await
        .unwrap();
}

pub(crate) fn analysis_context() -> AnalysisContext {
    let daily = uptrend("00700", 10);
    AnalysisContext {
        symbol: "00700".into(),
        market: Market::HK,
        analysis_date: daily[daily.len() - 1].date.clone(),
        profile: None,
        weekly: Vec::new(),
        monthly: Vec::new(),
        daily,
        history_model_id: None,
        history: Vec::new(),
        accuracy: AccuracyStats::default(),
        market_mood: None,
    }
}

pub(crate) fn context_with(close: f64, indicators: Indicators) -> AnalysisContext {
    let mut ctx = analysis_context();
    ctx.daily = vec![candle("00700", "2026-01-10", close, 0.0, indicators)];
    ctx.analysis_date = "2026-01-10".into();
    ctx
}

pub(crate) fn model(model_id: &str, priority: i64, provider: &str) -> PredictionModel {
    PredictionModel {
        model_id: model_id.into(),
        display_name: model_id.to_uppercase(),
        provider: provider.into(),
        is_active: true,
        priority,
        config: json!({}),
        capabilities: json!({}),
        created_at: None,
    }
}

pub(crate) async fn seed_prediction(
    store: &Store,
    symbol: &str,
    date: &str,
    model_id: &str,
    signal: Signal,
    is_primary: bool,
    status: ValidationStatus,
) -> Prediction {
    let p = Prediction {
        symbol: symbol.into(),
        date: date.into(),
        model_id: model_id.into(),
        target_date: date.into(),
        signal,
        confidence: 0.8,
        support_price: None,
        pressure_price: None,
        ai_reasoning: Some(PredictionPayload::new(signal, 0.8, "seed").to_json_string()),
        token_usage_input: 0,
        token_usage_output: 0,
        execution_time_ms: 0,
        validation_status: ValidationStatus::Pending,
        actual_change: None,
        is_primary,
        created_at: None,
        updated_at: None,
    };
    store.upsert_prediction(&p).await.unwrap();
    if status != ValidationStatus::Pending {
        store.apply_validation(&p, status, 1.0).await.unwrap();
    }
    p
}

/// Always predicts the same thing and counts its calls.
pub(crate) struct FixedAdapter {
    pub model_id: String,
    pub signal: Signal,
    pub confidence: f64,
    pub calls: AtomicUsize,
}

impl FixedAdapter {
    pub(crate) fn new(model_id: &str, signal: Signal, confidence: f64) -> Self {
        Self {
            model_id: model_id.into(),
            signal,
            confidence,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PredictionAdapter for FixedAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> &'static str {
        "fixed"
    }

    async fn predict(
        &self,
        _symbol: &str,
        _date: &str,
        context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut payload = PredictionPayload::new(
            self.signal,
            self.confidence,
            format!("{} 的固定结论", context.symbol),
        );
        payload.key_levels.support = 95.0;
        payload.key_levels.resistance = 110.0;
        Ok(AdapterOutcome::Prediction(AdapterOutput {
            payload,
            tokens_in: 10,
            tokens_out: 5,
            execution_ms: 1,
        }))
    }
}

pub(crate) struct FailingAdapter(pub String);

#[async_trait]
impl PredictionAdapter for FailingAdapter {
    fn model_id(&self) -> &str {
        &self.0
    }

    fn kind(&self) -> &'static str {
        "failing"
    }

    async fn predict(
        &self,
        _symbol: &str,
        _date: &str,
        _context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        Err(PipelineError::ProviderFatal("boom".into()))
    }
}

/// Fails every statement `fails` matches and passes the rest through to a
/// database shared with a healthy store.
pub(crate) struct FaultyBackend {
    inner: Arc<SqlxBackend>,
    fails: fn(&str, &[Value]) -> bool,
}

#[async_trait]
impl SqlBackend for FaultyBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
        if (self.fails)(sql, params) {
            return Err(StoreError::Fatal("injected failure".into()));
        }
        self.inner.execute(sql, params).await
    }

    async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64> {
        self.inner.execute_many(sql, batches).await
    }

    async fn close(&self) {}

    fn name(&self) -> &'static str {
        "faulty"
    }
}

/// `(healthy, faulty)` views of one in-memory database.
pub(crate) async fn faulty_store(fails: fn(&str, &[Value]) -> bool) -> (Store, Store) {
    let inner = Arc::new(SqlxBackend::connect("sqlite::memory:", 1).await.unwrap());
    let healthy = Store::new(inner.clone(), MarketClock::default());
    healthy.init_schema().await.unwrap();
    let faulty = Store::new(Arc::new(FaultyBackend { inner, fails }), MarketClock::default());
    (healthy, faulty)
}

pub(crate) fn mentions(params: &[Value], text: &str) -> bool {
    params.iter().any(|v| *v == Value::from(text))
}
