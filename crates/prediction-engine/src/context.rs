use dashmap::DashMap;
use pipeline_core::{
    AccuracyStats, AnalysisContext, HistoricalPrediction, Market, MarketMood, Period,
    PipelineError, PipelineResult,
};
use sql_store::Store;

pub const DAILY_WINDOW: usize = 10;
pub const PERIOD_WINDOW: usize = 12;
pub const HISTORY_WINDOW: usize = 5;

/// Builds the frozen per-(symbol, date) input every adapter sees.
/// Read-only against the store.
pub struct ContextBuilder {
    store: Store,
    /// Market breadth keyed by trading date; a new date is simply a new key.
    mood_cache: DashMap<String, Option<MarketMood>>,
}

impl ContextBuilder {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            mood_cache: DashMap::new(),
        }
    }

    /// `as_of = None` analyses the latest daily candle. `model_id = None`
    /// attaches the primary-history view.
    pub async fn build(
        &self,
        symbol: &str,
        as_of: Option<&str>,
        model_id: Option<&str>,
    ) -> PipelineResult<AnalysisContext> {
        let analysis_date = match as_of {
            Some(date) => self
                .store
                .candle_on(Period::Daily, symbol, date)
                .await?
                .map(|c| c.date)
                .ok_or_else(|| {
                    PipelineError::DataMissing(format!("no daily candle for {} on {}", symbol, date))
                })?,
            None => self
                .store
                .latest_candle_date(Period::Daily, symbol)
                .await?
                .ok_or_else(|| PipelineError::DataMissing(format!("no daily candles for {}", symbol)))?,
        };

        let profile = self.store.get_stock_meta(symbol).await?;
        let market = profile
            .as_ref()
            .map(|p| p.market)
            .unwrap_or_else(|| Market::infer(symbol));

        let daily = self
            .store
            .recent_candles(Period::Daily, symbol, &analysis_date, DAILY_WINDOW)
            .await?;
        let weekly = self
            .store
            .recent_candles(Period::Weekly, symbol, &analysis_date, PERIOD_WINDOW)
            .await?;
        let monthly = self
            .store
            .recent_candles(Period::Monthly, symbol, &analysis_date, PERIOD_WINDOW)
            .await?;

        let (history, accuracy) = self.history(symbol, model_id, &analysis_date).await?;
        let market_mood = self.market_mood(&analysis_date).await?;

        tracing::debug!(
            symbol,
            date = %analysis_date,
            daily = daily.len(),
            weekly = weekly.len(),
            monthly = monthly.len(),
            history = history.len(),
            "context built"
        );

        Ok(AnalysisContext {
            symbol: symbol.to_string(),
            market,
            analysis_date,
            profile,
            daily,
            weekly,
            monthly,
            history_model_id: model_id.map(str::to_string),
            history,
            accuracy,
            market_mood,
        })
    }

    /// Validated track record strictly before `before_date`.
    pub async fn history(
        &self,
        symbol: &str,
        model_id: Option<&str>,
        before_date: &str,
    ) -> PipelineResult<(Vec<HistoricalPrediction>, AccuracyStats)> {
        let history = self
            .store
            .prediction_history(symbol, model_id, before_date, HISTORY_WINDOW)
            .await?;
        let accuracy = self
            .store
            .prediction_accuracy(symbol, model_id, before_date)
            .await?;
        Ok((history, accuracy))
    }

    /// Same context with `model_id`'s own track record swapped in.
    pub async fn for_model(
        &self,
        base: &AnalysisContext,
        model_id: &str,
    ) -> PipelineResult<AnalysisContext> {
        let (history, accuracy) = self
            .history(&base.symbol, Some(model_id), &base.analysis_date)
            .await?;
        Ok(base.with_history(Some(model_id.to_string()), history, accuracy))
    }

    pub async fn market_mood(&self, date: &str) -> PipelineResult<Option<MarketMood>> {
        if let Some(cached) = self.mood_cache.get(date) {
            return Ok(*cached);
        }
        let mood = self.store.market_breadth(date).await?;
        self.mood_cache.insert(date.to_string(), mood);
        Ok(mood)
    }
}
