use async_trait::async_trait;
use pipeline_core::{AnalysisContext, PipelineResult, SkipReason};

use crate::adapter::{AdapterOutcome, PredictionAdapter};

/// Stands in for a model whose provider cannot run (no key, disabled,
/// unknown tag); always skips.
pub struct SkipAdapter {
    model_id: String,
    reason: SkipReason,
}

impl SkipAdapter {
    pub fn new(model_id: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            model_id: model_id.into(),
            reason,
        }
    }
}

#[async_trait]
impl PredictionAdapter for SkipAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> &'static str {
        "skip"
    }

    async fn predict(
        &self,
        _symbol: &str,
        _date: &str,
        _context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        Ok(AdapterOutcome::Skip(self.reason.clone()))
    }
}
