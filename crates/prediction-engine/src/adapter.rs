use async_trait::async_trait;
use pipeline_core::{AnalysisContext, PipelineResult, PredictionPayload, SkipReason};

/// What a successful adapter call hands back to the racer.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub payload: PredictionPayload,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    Prediction(AdapterOutput),
    /// No result, and not a failure.
    Skip(SkipReason),
}

/// One prediction provider, bound to a registered model.
///
/// Errors are hard failures: the racer logs them and carries on with the
/// other models.
#[async_trait]
pub trait PredictionAdapter: Send + Sync {
    fn model_id(&self) -> &str;

    fn kind(&self) -> &'static str;

    async fn predict(
        &self,
        symbol: &str,
        date: &str,
        context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome>;
}
