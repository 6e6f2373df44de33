use std::sync::Arc;
use std::time::{Duration, Instant};

use llm_client::{chat_with_retry, ChatMessage, ChatRequest, ProviderRegistry};
use pipeline_core::{
    preview, ChainTrace, PipelineError, PipelineResult, StepDetail, StockBrief, Tier, TraceStatus,
};
use serde_json::{json, Map, Value};
use sql_store::Store;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::news::{fetch_news, NewsArticle, NewsProvider};
use crate::prompts::{reasoning_reference, system_prompt, user_prompt, StockFacts};

pub const BRIEF_ATTEMPTS: usize = 3;
const PREVIEW_CHARS: usize = 200;

/// Phase 1 totals. `failed` holds `(symbol, tier, reason)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Phase1Report {
    pub date: String,
    pub symbols: usize,
    pub written: usize,
    pub failed: Vec<(String, Tier, String)>,
}

/// Writes one narrative per (symbol, tier) for the brief date.
pub struct StockAnalyzer {
    store: Store,
    registry: Arc<ProviderRegistry>,
    free_provider: String,
    pro_provider: String,
    news: Option<Arc<dyn NewsProvider>>,
    news_backoff: Duration,
}

impl StockAnalyzer {
    pub fn new(
        store: Store,
        registry: Arc<ProviderRegistry>,
        free_provider: impl Into<String>,
        pro_provider: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            free_provider: free_provider.into(),
            pro_provider: pro_provider.into(),
            news: None,
            news_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_news(mut self, news: Arc<dyn NewsProvider>) -> Self {
        self.news = Some(news);
        self
    }

    pub fn with_news_backoff(mut self, base: Duration) -> Self {
        self.news_backoff = base;
        self
    }

    fn provider_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Free => &self.free_provider,
            Tier::Pro => &self.pro_provider,
        }
    }

    /// Close, change and primary call for every symbol, loaded in three
    /// batch queries.
    pub async fn load_facts(&self, symbols: &[String], date: &str) -> PipelineResult<Vec<StockFacts>> {
        let primaries = self.store.primary_predictions_on(symbols, date).await?;
        let closes = self.store.latest_closes(symbols, date).await?;
        let metas = self.store.stock_metas(symbols).await?;

        Ok(symbols
            .iter()
            .map(|symbol| {
                let primary = primaries.get(symbol);
                let close = closes.get(symbol);
                StockFacts {
                    symbol: symbol.clone(),
                    name: metas.get(symbol).map(|m| m.name.clone()).unwrap_or_default(),
                    close: close.map(|c| c.0),
                    change_percent: close.map(|c| c.1),
                    signal: primary.map(|p| p.signal),
                    confidence: primary.map(|p| p.confidence),
                    reasoning: primary
                        .and_then(|p| p.ai_reasoning.as_deref())
                        .and_then(reasoning_reference),
                }
            })
            .collect())
    }

    /// `symbols = None` covers every symbol on any watchlist.
    pub async fn run(
        self: &Arc<Self>,
        date: &str,
        symbols: Option<Vec<String>>,
        concurrency: usize,
    ) -> PipelineResult<Phase1Report> {
        let universe = match symbols {
            Some(symbols) => symbols,
            None => self.store.watchlist_universe().await?,
        };
        let mut report = Phase1Report {
            date: date.to_string(),
            symbols: universe.len(),
            ..Default::default()
        };
        if universe.is_empty() {
            tracing::info!(date, "no watched symbols, nothing to brief");
            return Ok(report);
        }

        let facts = self.load_facts(&universe, date).await?;
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(facts.len());

        for stock in facts {
            let analyzer = Arc::clone(self);
            let semaphore = semaphore.clone();
            let date = date.to_string();
            handles.push(tokio::spawn(async move {
                let results = match semaphore.acquire_owned().await {
                    Ok(_permit) => analyzer.analyze_symbol(&stock, &date).await,
                    Err(e) => Tier::ALL
                        .iter()
                        .map(|tier| (*tier, Err(PipelineError::InvariantViolation(e.to_string()))))
                        .collect(),
                };
                (stock.symbol, results)
            }));
        }

        for (symbol, handle) in universe.iter().zip(handles) {
            match handle.await {
                Ok((symbol, results)) => {
                    for (tier, result) in results {
                        match result {
                            Ok(()) => report.written += 1,
                            Err(e) => {
                                tracing::error!(symbol = %symbol, tier = tier.as_str(), "stock brief failed: {}", e);
                                report.failed.push((symbol.clone(), tier, e.to_string()));
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(symbol = %symbol, "brief task panicked: {}", e);
                    for tier in Tier::ALL {
                        report.failed.push((symbol.clone(), tier, e.to_string()));
                    }
                }
            }
        }

        tracing::info!(
            date,
            symbols = report.symbols,
            written = report.written,
            failed = report.failed.len(),
            "phase 1 complete"
        );
        Ok(report)
    }

    /// News is searched once and shared by both tiers.
    pub async fn analyze_symbol(&self, stock: &StockFacts, date: &str) -> Vec<(Tier, PipelineResult<()>)> {
        let news = match &self.news {
            Some(provider) => {
                fetch_news(provider.as_ref(), &stock.symbol, &stock.name, date, self.news_backoff).await
            }
            None => Vec::new(),
        };

        let mut results = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL {
            results.push((tier, self.write_brief(tier, stock, &news, date).await));
        }
        results
    }

    async fn write_brief(
        &self,
        tier: Tier,
        stock: &StockFacts,
        news: &[NewsArticle],
        date: &str,
    ) -> PipelineResult<()> {
        let client = self.registry.get(self.provider_for(tier))?;
        let prompt = user_prompt(tier, stock, news);
        let request = ChatRequest::new(vec![
            ChatMessage::system(system_prompt(tier)),
            ChatMessage::user(prompt.clone()),
        ])
        .temperature(0.7);

        let started = Instant::now();
        let result = chat_with_retry(client.as_ref(), &request, BRIEF_ATTEMPTS)
            .await
            .map_err(PipelineError::from)
            .and_then(|response| {
                if response.content.trim().is_empty() {
                    Err(PipelineError::Parse("empty brief".to_string()))
                } else {
                    Ok(response)
                }
            });
        let elapsed = started.elapsed().as_millis() as u64;

        let news_json = serde_json::to_value(news)?;
        let mut artifacts = Map::new();
        artifacts.insert("news".into(), news_json.clone());

        let search = StepDetail {
            step: "search".into(),
            duration_ms: 0,
            tokens: 0,
            attempts: 1,
            prompt_preview: stock.symbol.clone(),
            output_preview: preview(
                &news.iter().map(|a| a.title.as_str()).collect::<Vec<_>>().join(" | "),
                PREVIEW_CHARS,
            ),
        };
        let mut trace = ChainTrace {
            trace_id: Uuid::new_v4().to_string(),
            symbol: stock.symbol.clone(),
            date: date.to_string(),
            model_id: client.provider_id().to_string(),
            strategy_name: format!("brief_{}", tier.as_str()),
            steps_executed: vec!["search".into()],
            steps_details: vec![search],
            artifacts,
            total_duration_ms: elapsed,
            total_tokens: 0,
            retry_count: 0,
            final_result: None,
            status: TraceStatus::Failed,
            error_step: None,
            error_reason: None,
        };

        match result {
            Ok(response) => {
                let markdown = response.content.trim().to_string();
                let tokens = response.tokens_in + response.tokens_out;
                trace.steps_executed.push("synthesis".into());
                trace.steps_details.push(StepDetail {
                    step: "synthesis".into(),
                    duration_ms: elapsed,
                    tokens,
                    attempts: 1,
                    prompt_preview: preview(&prompt, PREVIEW_CHARS),
                    output_preview: preview(&markdown, PREVIEW_CHARS),
                });
                trace.artifacts.insert("synthesis".into(), Value::String(markdown.clone()));
                trace.total_tokens = tokens;
                trace.final_result = Some(json!({ "tier": tier.as_str(), "analysis_markdown": markdown }));
                trace.status = TraceStatus::Success;
                self.store.insert_trace(&trace).await?;

                self.store
                    .upsert_stock_brief(&StockBrief {
                        symbol: stock.symbol.clone(),
                        date: date.to_string(),
                        tier,
                        stock_name: stock.display_name().to_string(),
                        analysis_markdown: markdown,
                        raw_news: Some(news_json.to_string()),
                        signal: stock.signal,
                        confidence: stock.confidence,
                        created_at: None,
                    })
                    .await?;
                tracing::debug!(symbol = %stock.symbol, tier = tier.as_str(), tokens, "stock brief written");
                Ok(())
            }
            Err(e) => {
                trace.error_step = Some("synthesis".into());
                trace.error_reason = Some(e.to_string());
                self.store.insert_trace(&trace).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::news::tests::{article, StaticNews};
    use llm_client::{LlmError, Role, ScriptedClient};
    use pipeline_core::{
        Candle, Indicators, Market, Period, Prediction, Signal, StockMeta, User, ValidationStatus,
    };

    pub(crate) fn user(id: &str, tier: &str) -> User {
        User {
            user_id: id.into(),
            subscription_tier: tier.into(),
            subscription_expires_at: None,
            notification_settings: None,
        }
    }

    async fn seed(store: &Store) {
        store
            .upsert_candles(
                Period::Daily,
                &[Candle {
                    symbol: "00700".into(),
                    date: "2026-01-09".into(),
                    open: 380.0,
                    high: 390.0,
                    low: 378.0,
                    close: 388.2,
                    volume: 1_000_000.0,
                    change_percent: 1.25,
                    indicators: Indicators::default(),
                }],
            )
            .await
            .unwrap();
        store
            .upsert_stock_meta(&StockMeta {
                symbol: "00700".into(),
                name: "腾讯控股".into(),
                market: Market::HK,
                last_updated: None,
                industry: None,
                main_business: None,
                description: None,
            })
            .await
            .unwrap();
        store
            .upsert_prediction(&Prediction {
                symbol: "00700".into(),
                date: "2026-01-09".into(),
                model_id: "m1".into(),
                target_date: "2026-01-12".into(),
                signal: Signal::Long,
                confidence: 0.82,
                support_price: None,
                pressure_price: None,
                ai_reasoning: Some(r#"{"summary":"放量突破"}"#.into()),
                token_usage_input: 0,
                token_usage_output: 0,
                execution_time_ms: 0,
                validation_status: ValidationStatus::Pending,
                actual_change: None,
                is_primary: true,
                created_at: None,
                updated_at: None,
            })
            .await
            .unwrap();
        store.upsert_user(&user("u1", "free")).await.unwrap();
        store.add_to_watchlist("u1", "00700").await.unwrap();
    }

    fn registry(free: Arc<ScriptedClient>, pro: Arc<ScriptedClient>) -> Arc<ProviderRegistry> {
        let registry = ProviderRegistry::empty();
        registry.insert(free);
        registry.insert(pro);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn writes_both_tiers_with_traces() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        let free = Arc::new(ScriptedClient::repeating("free-llm", "**偏多**，回购托底。"));
        let pro = Arc::new(ScriptedClient::repeating("pro-llm", "### 核心观点\n放量突破。"));
        let news = Arc::new(StaticNews::new(vec![article("腾讯控股宣布回购", "2026-01-08")]));

        let analyzer = Arc::new(
            StockAnalyzer::new(store.clone(), registry(free.clone(), pro.clone()), "free-llm", "pro-llm")
                .with_news(news.clone())
                .with_news_backoff(Duration::ZERO),
        );
        let report = analyzer.run("2026-01-09", None, 4).await.unwrap();
        assert_eq!((report.symbols, report.written), (1, 2));
        assert!(report.failed.is_empty());

        // one search shared by both tiers
        assert_eq!(news.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let brief = store.get_stock_brief("00700", "2026-01-09", Tier::Pro).await.unwrap().unwrap();
        assert_eq!(brief.stock_name, "腾讯控股");
        assert_eq!(brief.signal, Some(Signal::Long));
        assert_eq!(brief.confidence, Some(0.82));
        assert!(brief.analysis_markdown.starts_with("### 核心观点"));
        assert!(brief.raw_news.unwrap().contains("腾讯控股宣布回购"));

        let pro_request = &pro.requests()[0];
        assert_eq!(pro_request.messages[0].role, Role::System);
        assert!(pro_request.messages[0].content.contains("首席专栏作家"));
        let prompt = &pro_request.messages[1].content;
        assert!(prompt.contains("收盘价 388.20，涨跌幅 +1.25%"));
        assert!(prompt.contains("腾讯控股宣布回购"));
        assert!(prompt.contains("放量突破"));
        assert!(free.requests()[0].messages[0].content.contains("财经助理"));

        let traces = store.traces_for("00700", "2026-01-09").await.unwrap();
        assert_eq!(traces.len(), 2);
        for trace in &traces {
            assert_eq!(trace.status, TraceStatus::Success);
            assert_eq!(trace.steps_executed, vec!["search", "synthesis"]);
            assert_eq!(trace.steps_details[0].duration_ms, 0);
        }
    }

    #[tokio::test]
    async fn provider_failure_writes_failed_trace() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        let free = Arc::new(ScriptedClient::new("free-llm").respond_with(|_| Err(LlmError::Unauthorized(401))));
        let pro = Arc::new(ScriptedClient::repeating("pro-llm", "观点"));

        let analyzer = Arc::new(StockAnalyzer::new(
            store.clone(),
            registry(free, pro),
            "free-llm",
            "pro-llm",
        ));
        let report = analyzer.run("2026-01-09", Some(vec!["00700".into()]), 1).await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1, Tier::Free);

        assert!(store.get_stock_brief("00700", "2026-01-09", Tier::Free).await.unwrap().is_none());
        assert!(store.get_stock_brief("00700", "2026-01-09", Tier::Pro).await.unwrap().is_some());
        let failed: Vec<ChainTrace> = store
            .traces_for("00700", "2026-01-09")
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.status == TraceStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_step.as_deref(), Some("synthesis"));
        assert_eq!(failed[0].steps_executed, vec!["search"]);
    }

    #[tokio::test]
    async fn rerun_overwrites_brief() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        let free = Arc::new(
            ScriptedClient::new("free-llm")
                .then_ok("第一版")
                .then_ok("第二版"),
        );
        let pro = Arc::new(ScriptedClient::repeating("pro-llm", "观点"));
        let analyzer = Arc::new(StockAnalyzer::new(store.clone(), registry(free, pro), "free-llm", "pro-llm"));

        analyzer.run("2026-01-09", None, 2).await.unwrap();
        analyzer.run("2026-01-09", None, 2).await.unwrap();
        let brief = store.get_stock_brief("00700", "2026-01-09", Tier::Free).await.unwrap().unwrap();
        assert_eq!(brief.analysis_markdown, "第二版");
    }

    #[tokio::test]
    async fn empty_universe_is_a_no_op() {
        let store = Store::in_memory().await.unwrap();
        let analyzer = Arc::new(StockAnalyzer::new(
            store,
            Arc::new(ProviderRegistry::empty()),
            "free-llm",
            "pro-llm",
        ));
        let report = analyzer.run("2026-01-09", None, 2).await.unwrap();
        assert_eq!(report, Phase1Report { date: "2026-01-09".into(), ..Default::default() });
    }
}
