use std::time::Instant;

use async_trait::async_trait;
use pipeline_core::{
    AnalysisContext, PipelineError, PipelineResult, PredictionPayload, ReasoningStep, Signal,
};
use reasoning_chain::{default_tactics, key_levels};

use crate::adapter::{AdapterOutcome, AdapterOutput, PredictionAdapter};

/// Deterministic moving-average alignment classifier. No tokens, no I/O.
pub struct RuleAdapter {
    model_id: String,
}

impl RuleAdapter {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
        }
    }

    pub fn classify(context: &AnalysisContext) -> PipelineResult<PredictionPayload> {
        let latest = context.latest().ok_or_else(|| {
            PipelineError::DataMissing(format!("no daily candle for {}", context.symbol))
        })?;
        let ind = &latest.indicators;
        let data = format!(
            "收盘 {:.2}，MA5 {:.2}，MA10 {:.2}，MA20 {:.2}",
            latest.close, ind.ma5, ind.ma10, ind.ma20
        );

        let bullish = ind.ma5 > ind.ma10 && ind.ma10 > ind.ma20;
        let bearish = ind.ma5 < ind.ma10 && ind.ma10 < ind.ma20;
        let (signal, confidence, conclusion) = if !ind.is_populated() {
            (Signal::Side, 0.5, "指标数据不足，保持观望")
        } else if bullish && latest.close > ind.ma5 {
            (Signal::Long, 0.8, "均线多头排列且股价站上五日线，趋势向上")
        } else if bullish {
            (Signal::Long, 0.7, "均线多头排列，但股价回落至五日线下方")
        } else if bearish && latest.close < ind.ma5 {
            (Signal::Short, 0.8, "均线空头排列且股价受压于五日线，趋势向下")
        } else if bearish {
            (Signal::Short, 0.7, "均线空头排列，但股价反弹至五日线上方")
        } else {
            (Signal::Side, 0.6, "均线交织，方向不明，建议观望")
        };

        let levels = key_levels(&context.daily);
        let mut payload = PredictionPayload::new(
            signal,
            confidence,
            format!("{}：{}", context.stock_name(), conclusion),
        );
        payload.reasoning_trace = vec![ReasoningStep {
            step: "均线排列".to_string(),
            data,
            conclusion: conclusion.to_string(),
        }];
        payload.backfill(&levels, &default_tactics(&levels));
        Ok(payload)
    }
}

#[async_trait]
impl PredictionAdapter for RuleAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> &'static str {
        "rule"
    }

    async fn predict(
        &self,
        _symbol: &str,
        _date: &str,
        context: &AnalysisContext,
    ) -> PipelineResult<AdapterOutcome> {
        let started = Instant::now();
        let payload = Self::classify(context)?;
        Ok(AdapterOutcome::Prediction(AdapterOutput {
            payload,
            tokens_in: 0,
            tokens_out: 0,
            execution_ms: started.elapsed().as_millis() as u64,
        }))
    }
}
