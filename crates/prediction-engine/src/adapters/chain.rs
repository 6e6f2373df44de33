use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llm_client::LlmClient;
use pipeline_core::{AnalysisContext, PipelineError, PipelineResult};
use reasoning_chain::{ChainExecutor, Strategy};
use sql_store::Store;

use crate::adapter::{AdapterOutcome, AdapterOutput, PredictionAdapter};

/// Runs a named reasoning-chain strategy; the synthesis JSON (with its full
/// reasoning trace) becomes the prediction.
pub struct ChainAdapter {
    model_id: String,
    strategy: String,
    client: Arc<dyn LlmClient>,
    store: Store,
    lite: bool,
    backoff_base: Option<Duration>,
}

impl ChainAdapter {
    pub fn new(
        model_id: impl Into<String>,
        strategy: impl Into<String>,
        client: Arc<dyn LlmClient>,
        store: Store,
        lite: bool,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            strategy: strategy.into(),
            client,
            store,
            lite,
            backoff_base: None,
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }
}

#[async_trait]
impl PredictionAdapter for ChainAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> &'static str {
        "chain"
    }

    async fn predict(
        &self,
        _symbol: &str,
        _date: &str,
        context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        let strategy = Strategy::by_name(&self.strategy).ok_or_else(|| {
            PipelineError::Config(format!("unknown chain strategy '{}'", self.strategy))
        })?;
        let mut executor = ChainExecutor::new(self.client.clone(), self.store.clone());
        if let Some(base) = self.backoff_base {
            executor = executor.with_backoff_base(base);
        }
        let lite = self.lite || self.client.is_lite();
        let outcome = executor
            .run(&strategy, &self.model_id, context.clone(), lite)
            .await?;

        Ok(AdapterOutcome::Prediction(AdapterOutput {
            payload: outcome.payload,
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            execution_ms: outcome.duration_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::analysis_context;
    use llm_client::{ChatRequest, ScriptedClient};
    use reasoning_chain::{translate_confluence, SignalDashboard};

    #[tokio::test]
    async fn lite_chain_follows_confluence() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(
            ScriptedClient::new("flash")
                .lite()
                .respond_with(|req: &ChatRequest| {
                    if req.last_user().contains("第四步") {
                        Ok("{\"summary\": \"按共振方向执行\"}".to_string())
                    } else {
                        Ok("分析完成".to_string())
                    }
                }),
        );
        let adapter = ChainAdapter::new("chain-flash", "four_step", client, store.clone(), false)
            .with_backoff_base(Duration::ZERO);
        let ctx = analysis_context();
        let outcome = adapter.predict("00700", &ctx.analysis_date, &ctx).await.unwrap();
        let AdapterOutcome::Prediction(out) = outcome else {
            panic!("expected a prediction");
        };
        let expected = translate_confluence(SignalDashboard::compute(&ctx.daily).confluence);
        assert_eq!((out.payload.signal, out.payload.confidence), expected);
        assert_eq!(out.payload.summary, "按共振方向执行");
        let traces = store.traces_for("00700", &ctx.analysis_date).await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].model_id, "chain-flash");
    }

    #[tokio::test]
    async fn unknown_strategy_is_a_hard_failure() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::repeating("x", "ok"));
        let adapter = ChainAdapter::new("chain-x", "tree_search", client.clone(), store, false);
        let ctx = analysis_context();
        assert!(matches!(
            adapter.predict("00700", &ctx.analysis_date, &ctx).await,
            Err(PipelineError::Config(_))
        ));
        assert_eq!(client.call_count(), 0);
    }
}
