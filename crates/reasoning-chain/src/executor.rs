use std::sync::Arc;
use std::time::{Duration, Instant};

use llm_client::{ChatMessage, ChatRequest, ChatResponse, LlmClient, LlmResult};
use pipeline_core::{
    preview, AnalysisContext, ChainTrace, PipelineError, PipelineResult, PredictionPayload,
    StepDetail, TraceStatus,
};
use sql_store::Store;
use tokio::sync::watch;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use crate::memory::ChainContext;
use crate::steps::ChainStep;
use crate::strategy::{Strategy, RULE_CODA};

const PREVIEW_CHARS: usize = 200;

/// Result of a successful chain run.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub payload: PredictionPayload,
    pub trace_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
}

/// Runs a [`Strategy`] step by step against one LLM client and persists
/// exactly one trace per run.
pub struct ChainExecutor {
    client: Arc<dyn LlmClient>,
    store: Store,
    max_retries: u32,
    backoff_base: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

#[derive(Default)]
struct RunLog {
    executed: Vec<String>,
    details: Vec<StepDetail>,
    retries: u32,
}

impl ChainExecutor {
    pub fn new(client: Arc<dyn LlmClient>, store: Store) -> Self {
        Self {
            client,
            store,
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            cancel: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Abort cooperatively once `true` is published on the channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(
        &self,
        strategy: &Strategy,
        model_id: &str,
        analysis: AnalysisContext,
        lite: bool,
    ) -> PipelineResult<ChainOutcome> {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let symbol = analysis.symbol.clone();
        let date = analysis.analysis_date.clone();
        let mut ctx = ChainContext::new(analysis, lite);
        let mut log = RunLog::default();
        let mut cancel = self.cancel.clone();

        let mut result = Ok(());
        for step in strategy.steps() {
            if is_cancelled(&cancel) {
                result = Err(step_error(step.name(), "cancelled"));
                break;
            }
            if let Err(e) = self
                .run_step(strategy, step.as_ref(), &mut ctx, &mut log, &mut cancel)
                .await
            {
                result = Err(e);
                break;
            }
            log.executed.push(step.name().to_string());
        }

        let result = result.and_then(|_| {
            ctx.result.clone().ok_or_else(|| {
                PipelineError::InvariantViolation(format!(
                    "strategy {} finished without a synthesis result",
                    strategy.name()
                ))
            })
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        let (error_step, error_reason) = match &result {
            Ok(_) => (None, None),
            Err(PipelineError::StepExecution { step, reason }) => {
                (Some(step.clone()), Some(reason.clone()))
            }
            Err(e) => (None, Some(e.to_string())),
        };
        let trace = ChainTrace {
            trace_id: trace_id.clone(),
            symbol: symbol.clone(),
            date: date.clone(),
            model_id: model_id.to_string(),
            strategy_name: strategy.name().to_string(),
            steps_executed: log.executed,
            steps_details: log.details,
            artifacts: std::mem::take(&mut ctx.artifacts),
            total_duration_ms: duration_ms,
            total_tokens: ctx.total_tokens(),
            retry_count: log.retries,
            final_result: result.as_ref().ok().map(|p| p.to_value()),
            status: if result.is_ok() {
                TraceStatus::Success
            } else {
                TraceStatus::Failed
            },
            error_step,
            error_reason,
        };
        if let Err(e) = self.store.insert_trace(&trace).await {
            tracing::error!(trace_id = %trace_id, "failed to persist chain trace: {}", e);
        }

        match result {
            Ok(payload) => {
                tracing::info!(
                    symbol = %symbol,
                    date = %date,
                    model_id,
                    trace_id = %trace_id,
                    tokens = ctx.total_tokens(),
                    duration_ms,
                    "chain completed: {} @ {:.2}",
                    payload.signal,
                    payload.confidence
                );
                Ok(ChainOutcome {
                    payload,
                    trace_id,
                    tokens_in: ctx.tokens_in,
                    tokens_out: ctx.tokens_out,
                    duration_ms,
                })
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, date = %date, model_id, trace_id = %trace_id, "chain failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_step(
        &self,
        strategy: &Strategy,
        step: &dyn ChainStep,
        ctx: &mut ChainContext,
        log: &mut RunLog,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> PipelineResult<()> {
        let prompt = format!(
            "{}{}{}",
            ctx.recall_block(step.memory_inputs()),
            step.build_prompt(ctx),
            RULE_CODA
        );
        let mut request = ChatRequest::new(vec![
            ChatMessage::system(strategy.system_prompt()),
            ChatMessage::user(prompt.clone()),
        ])
        .temperature(step.temperature());
        if step.json_output() {
            request = request.json();
        }

        let started = Instant::now();
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor((self.backoff_base.as_millis() as u64) / 2)
            .map(jitter);
        let mut attempts = 0u32;
        let mut step_tokens = 0u64;
        let mut last_output = String::new();

        let outcome = loop {
            attempts += 1;
            let reason = match self.call(&request, cancel).await {
                None => break Err("cancelled".to_string()),
                Some(Ok(response)) => {
                    step_tokens += response.tokens_in + response.tokens_out;
                    record_tokens(ctx, &response);
                    ctx.messages.push(ChatMessage::user(prompt.clone()));
                    ctx.messages.push(ChatMessage::assistant(response.content.clone()));
                    last_output = response.content;
                    match step.parse(&last_output, ctx) {
                        Ok(()) => break Ok(()),
                        Err(e) => e.to_string(),
                    }
                }
                Some(Err(e)) => e.to_string(),
            };

            if attempts > self.max_retries {
                break Err(reason);
            }
            log.retries += 1;
            tracing::warn!(
                step = step.name(),
                attempt = attempts,
                "chain step failed, retrying: {}",
                reason
            );
            let delay = delays.next().unwrap_or(self.backoff_base);
            if sleep_or_cancel(delay, cancel).await {
                break Err("cancelled".to_string());
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        ctx.step_durations.push((step.name().to_string(), duration_ms));
        log.details.push(StepDetail {
            step: step.name().to_string(),
            duration_ms,
            tokens: step_tokens,
            attempts,
            prompt_preview: preview(&prompt, PREVIEW_CHARS),
            output_preview: preview(&last_output, PREVIEW_CHARS),
        });

        outcome.map_err(|reason| step_error(step.name(), &reason))
    }

    /// `None` when cancelled mid-flight.
    async fn call(
        &self,
        request: &ChatRequest,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Option<LlmResult<ChatResponse>> {
        match cancel {
            Some(rx) => tokio::select! {
                res = self.client.chat(request) => Some(res),
                _ = cancelled(rx) => None,
            },
            None => Some(self.client.chat(request).await),
        }
    }
}

fn record_tokens(ctx: &mut ChainContext, response: &ChatResponse) {
    ctx.tokens_in += response.tokens_in;
    ctx.tokens_out += response.tokens_out;
}

fn step_error(step: &str, reason: &str) -> PipelineError {
    PipelineError::StepExecution {
        step: step.to_string(),
        reason: reason.to_string(),
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer happen.
            std::future::pending::<()>().await;
        }
    }
}

/// Returns true if cancelled during the sleep.
async fn sleep_or_cancel(delay: Duration, cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    match cancel {
        Some(rx) => tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancelled(rx) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use llm_client::{LlmError, ScriptedClient};
    use pipeline_core::Signal;

    const SYNTHESIS: &str = r#"{"signal": "Long", "confidence": 0.82, "summary": "多周期共振向上"}"#;

    fn by_step(request: &ChatRequest) -> LlmResult<String> {
        let prompt = request.last_user();
        if prompt.contains("第四步") {
            Ok(SYNTHESIS.to_string())
        } else if prompt.contains("第一步") {
            Ok("数据已确认，近期稳步上行。".to_string())
        } else {
            Ok("技术面偏多。".to_string())
        }
    }

    fn executor(client: Arc<ScriptedClient>, store: Store) -> ChainExecutor {
        ChainExecutor::new(client, store).with_backoff_base(Duration::ZERO)
    }

    #[tokio::test]
    async fn successful_run_writes_one_trace() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(by_step));
        let outcome = executor(client.clone(), store.clone())
            .run(&Strategy::four_step(), "chain-ds", context(), false)
            .await
            .unwrap();

        assert_eq!(outcome.payload.signal, Signal::Long);
        assert_eq!(outcome.payload.key_levels.support, 90.0);
        assert!(outcome.tokens_in > 0 && outcome.tokens_out > 0);

        let traces = store.traces_for("00700", "2026-01-02").await.unwrap();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.trace_id, outcome.trace_id);
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.steps_executed.len(), 4);
        assert_eq!(trace.retry_count, 0);
        assert!(trace.artifacts.contains_key("synthesis"));
        assert_eq!(trace.final_result.as_ref().unwrap()["signal"], "Long");
    }

    #[tokio::test]
    async fn later_steps_see_only_distilled_memory() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(by_step));
        executor(client.clone(), store)
            .run(&Strategy::four_step(), "chain-ds", context(), false)
            .await
            .unwrap();

        let requests = client.requests();
        assert_eq!(requests.len(), 4);
        let indicator = requests[1].last_user();
        assert!(indicator.contains("【数据锚定结论】"));
        assert!(indicator.contains("数据已确认"));
        assert!(!indicator.contains("第一步"));
        let period = requests[2].last_user();
        assert!(period.contains("【技术面结论】"));
        assert!(!period.contains("【数据锚定结论】"));
        assert!(requests[3].json_mode);
        assert!(requests.iter().all(|r| r.last_user().contains("不得编造")));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(
            ScriptedClient::new("deepseek")
                .then_err(LlmError::RateLimited(429))
                .respond_with(by_step),
        );
        executor(client.clone(), store.clone())
            .run(&Strategy::four_step(), "chain-ds", context(), false)
            .await
            .unwrap();
        let traces = store.traces_for("00700", "2026-01-02").await.unwrap();
        assert_eq!(traces[0].retry_count, 1);
        assert_eq!(traces[0].steps_details[0].attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_step_writes_failed_trace() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(|req: &ChatRequest| {
            if req.last_user().contains("第四步") {
                Ok("I think it goes up.".to_string())
            } else {
                Ok("ok".to_string())
            }
        }));
        let err = executor(client.clone(), store.clone())
            .run(&Strategy::four_step(), "chain-ds", context(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepExecution { ref step, .. } if step == "synthesis"));
        // three prose steps + 1 try + 2 retries of synthesis
        assert_eq!(client.call_count(), 6);

        let traces = store.traces_for("00700", "2026-01-02").await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].status, TraceStatus::Failed);
        assert_eq!(traces[0].error_step.as_deref(), Some("synthesis"));
        assert_eq!(traces[0].retry_count, 2);
        assert_eq!(traces[0].steps_executed.len(), 3);
        assert!(traces[0].final_result.is_none());
    }

    #[tokio::test]
    async fn cancellation_writes_failed_trace() {
        let store = Store::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::new("deepseek").respond_with(by_step));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = executor(client.clone(), store.clone())
            .with_cancellation(rx)
            .run(&Strategy::four_step(), "chain-ds", context(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepExecution { ref reason, .. } if reason == "cancelled"));
        assert_eq!(client.call_count(), 0);
        let traces = store.traces_for("00700", "2026-01-02").await.unwrap();
        assert_eq!(traces[0].status, TraceStatus::Failed);
        assert_eq!(traces[0].error_step.as_deref(), Some("anchor"));
    }
}
