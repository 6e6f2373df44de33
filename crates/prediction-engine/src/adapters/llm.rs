use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use llm_client::{ChatMessage, ChatRequest, LlmClient};
use pipeline_core::{
    extract_json_object, AnalysisContext, PipelineError, PipelineResult, PredictionPayload,
};
use reasoning_chain::{default_tactics, key_levels, SignalDashboard, OUTPUT_CONTRACT};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::adapter::{AdapterOutcome, AdapterOutput, PredictionAdapter};

pub const SINGLE_SHOT_ATTEMPTS: usize = 3;

const SYSTEM_PROMPT: &str = "你是一名专业、保守的证券分析师。\
只依据用户提供的数据判断下一个交易日的方向，绝不编造数据。\
只输出一个 JSON 对象，不要输出任何额外文字。";

/// Single-shot chat completion against any configured provider. The
/// transport (OpenAI-compatible or Gemini) is whatever client it wraps.
pub struct LlmAdapter {
    model_id: String,
    kind: &'static str,
    client: Arc<dyn LlmClient>,
    attempts: usize,
    backoff_base: Duration,
}

impl LlmAdapter {
    pub fn new(model_id: impl Into<String>, kind: &'static str, client: Arc<dyn LlmClient>) -> Self {
        Self {
            model_id: model_id.into(),
            kind,
            client,
            attempts: SINGLE_SHOT_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn build_request(context: &AnalysisContext) -> ChatRequest {
        let dashboard = SignalDashboard::compute(&context.daily);
        let levels = key_levels(&context.daily);
        let mood = context
            .market_mood
            .map(|m| m.describe_zh())
            .unwrap_or_else(|| "暂无".to_string());

        let prompt = format!(
            "## 标的\n{}（{}，{}市场），分析日期 {}\n\n\
             ## 当日市场情绪\n{}\n\n\
             ## 最近交易日行情\n{}\n\
             ## 技术信号仪表盘（程序计算）\n{}\n\n\
             ## 关键价位\n支撑 {:.2} / 压力 {:.2} / 止损 {:.2}\n\n\
             ## 你的历史战绩\n{}\n\
             ## 规则\n\
             - 默认输出 Side，只有证据充分且相互印证时才输出 Long 或 Short。\n\
             - confidence 取值 0 到 1。\n\n\
             ## 输出格式\n{}",
            context.stock_name(),
            context.symbol,
            context.market.as_str(),
            context.analysis_date,
            mood,
            context.daily_table(),
            dashboard.render(),
            levels.support,
            levels.resistance,
            levels.stop_loss,
            context.history_summary(),
            OUTPUT_CONTRACT
        );

        ChatRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .temperature(0.2)
            .json()
    }

    pub fn parse(content: &str, context: &AnalysisContext) -> PipelineResult<PredictionPayload> {
        let map = extract_json_object(content)
            .ok_or_else(|| PipelineError::Parse("response contains no JSON object".to_string()))?;
        let levels = key_levels(&context.daily);
        PredictionPayload::from_value_with_defaults(
            &Value::Object(map),
            &levels,
            &default_tactics(&levels),
        )
    }
}

#[async_trait]
impl PredictionAdapter for LlmAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn predict(
        &self,
        symbol: &str,
        _date: &str,
        context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        let request = &Self::build_request(context);
        let client = &self.client;
        let started = Instant::now();

        let delays = ExponentialBackoff::from_millis(2)
            .factor((self.backoff_base.as_millis() as u64) / 2)
            .map(jitter)
            .take(self.attempts.saturating_sub(1));

        let result = RetryIf::spawn(
            delays,
            move || async move {
                let response = client.chat(request).await.map_err(PipelineError::from)?;
                let payload = Self::parse(&response.content, context)?;
                Ok::<_, PipelineError>((payload, response.tokens_in, response.tokens_out))
            },
            |e: &PipelineError| {
                let retry = matches!(e, PipelineError::ProviderTransient(_) | PipelineError::Parse(_));
                if retry {
                    tracing::warn!(symbol, model_id = %self.model_id, "retrying single-shot prediction: {}", e);
                }
                retry
            },
        )
        .await;

        match result {
            Ok((payload, tokens_in, tokens_out)) => Ok(AdapterOutcome::Prediction(AdapterOutput {
                payload,
                tokens_in,
                tokens_out,
                execution_ms: started.elapsed().as_millis() as u64,
            })),
            Err(PipelineError::ProviderTransient(reason)) => Err(PipelineError::ProviderFatal(
                format!("retries exhausted: {}", reason),
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::analysis_context;
    use llm_client::{LlmError, Role, ScriptedClient};
    use pipeline_core::Signal;

    fn adapter(client: Arc<ScriptedClient>) -> LlmAdapter {
        LlmAdapter::new("ds-v3", "openai", client).with_backoff_base(Duration::ZERO)
    }

    #[tokio::test]
    async fn parses_fenced_json() {
        let client = Arc::new(ScriptedClient::new("deepseek").then_ok(
            "好的：\n```json\n{\"signal\":\"Short\",\"confidence\":\"85%\",\"summary\":\"破位\"}\n```",
        ));
        let ctx = analysis_context();
        let outcome = adapter(client.clone()).predict("00700", "2026-01-15", &ctx).await.unwrap();
        let AdapterOutcome::Prediction(out) = outcome else {
            panic!("expected a prediction");
        };
        assert_eq!(out.payload.signal, Signal::Short);
        assert_eq!(out.payload.confidence, 0.85);
        assert!(out.tokens_in > 0);
        let request = &client.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.json_mode);
    }

    #[tokio::test]
    async fn parse_errors_retry_up_to_three_times() {
        let client = Arc::new(
            ScriptedClient::new("deepseek")
                .then_ok("no json here")
                .then_err(LlmError::ServiceUnavailable { status: 503, body: String::new() })
                .then_ok("{\"signal\":\"Side\",\"confidence\":0.6,\"summary\":\"观望\"}"),
        );
        let outcome = adapter(client.clone())
            .predict("00700", "2026-01-15", &analysis_context())
            .await
            .unwrap();
        assert!(matches!(outcome, AdapterOutcome::Prediction(_)));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_transient_becomes_fatal() {
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(|_| Err(LlmError::RateLimited(429))));
        let err = adapter(client.clone())
            .predict("00700", "2026-01-15", &analysis_context())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProviderFatal(_)));
        assert_eq!(client.call_count(), SINGLE_SHOT_ATTEMPTS);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(|_| Err(LlmError::Unauthorized(401))));
        assert!(adapter(client.clone())
            .predict("00700", "2026-01-15", &analysis_context())
            .await
            .is_err());
        assert_eq!(client.call_count(), 1);
    }
}
