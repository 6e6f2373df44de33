//! The canonical four-step strategy: anchor, indicator, multi-period, synthesis.

use pipeline_core::{
    extract_json_object, AnalysisContext, Candle, PipelineError, PipelineResult, PredictionPayload,
};
use serde_json::{json, Value};

use crate::breaker::translate_confluence;
use crate::memory::{ChainContext, MemoryKey};

/// One prompt/parse round of a chain.
///
/// Steps are pure: the executor owns the LLM call, retries and timing.
pub trait ChainStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn temperature(&self) -> f32;

    /// Predecessor conclusions this step wants prepended to its prompt.
    fn memory_inputs(&self) -> &'static [MemoryKey] {
        &[]
    }

    fn json_output(&self) -> bool {
        false
    }

    fn build_prompt(&self, ctx: &ChainContext) -> String;

    fn parse(&self, output: &str, ctx: &mut ChainContext) -> PipelineResult<()>;
}

fn require_text(step: &str, output: &str) -> PipelineResult<()> {
    if output.trim().is_empty() {
        return Err(PipelineError::Parse(format!("{} returned empty output", step)));
    }
    Ok(())
}

fn profile_block(analysis: &AnalysisContext) -> String {
    let mut out = format!(
        "- 名称：{}（{}，{}市场）\n",
        analysis.stock_name(),
        analysis.symbol,
        analysis.market.as_str()
    );
    if let Some(profile) = &analysis.profile {
        if let Some(industry) = profile.industry.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("- 行业：{}\n", industry));
        }
        if let Some(business) = profile.main_business.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("- 主营：{}\n", business));
        }
    }
    out
}

fn period_row(label: &str, candle: Option<&Candle>) -> String {
    match candle {
        Some(c) => format!(
            "- {}（{}）：收盘 {:.2}，涨跌 {:+.2}%，MA5 {:.2}，MA20 {:.2}，MACD {:.3}/{:.3}，RSI {:.1}\n",
            label,
            c.date,
            c.close,
            c.change_percent,
            c.indicators.ma5,
            c.indicators.ma20,
            c.indicators.macd,
            c.indicators.macd_signal,
            c.indicators.rsi
        ),
        None => format!("- {}：暂无数据\n", label),
    }
}

// -- Anchor -----------------------------------------------------------------

pub struct AnchorStep;

impl ChainStep for AnchorStep {
    fn name(&self) -> &'static str {
        "anchor"
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn build_prompt(&self, ctx: &ChainContext) -> String {
        let analysis = &ctx.analysis;
        let drops: Vec<String> = analysis
            .daily
            .iter()
            .filter(|c| c.change_percent < -5.0)
            .map(|c| format!("{}（{:+.2}%）", c.date, c.change_percent))
            .collect();
        let mood = analysis
            .market_mood
            .map(|m| m.describe_zh())
            .unwrap_or_else(|| "暂无".to_string());

        format!(
            "## 第一步：数据锚定\n\n### 标的\n{}\n### 当日市场情绪\n{}\n\n### 最近 {} 个交易日\n{}\n\
             单日跌幅超过 5% 的交易日：{}\n\n\
             请先确认你已读取以上数据，点名说明任何单日跌幅超过 5% 的异常，\
             然后用 3 到 5 句话概括当前价格状态。",
            profile_block(analysis),
            mood,
            analysis.daily.len(),
            analysis.daily_table(),
            if drops.is_empty() { "无".to_string() } else { drops.join("、") }
        )
    }

    fn parse(&self, output: &str, ctx: &mut ChainContext) -> PipelineResult<()> {
        require_text(self.name(), output)?;
        ctx.artifacts.insert(self.name().into(), Value::String(output.to_string()));
        ctx.remember(MemoryKey::AnchorSummary, output);
        Ok(())
    }
}

// -- Indicator --------------------------------------------------------------

pub struct IndicatorStep;

impl ChainStep for IndicatorStep {
    fn name(&self) -> &'static str {
        "indicator"
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn memory_inputs(&self) -> &'static [MemoryKey] {
        &[MemoryKey::AnchorSummary]
    }

    fn build_prompt(&self, ctx: &ChainContext) -> String {
        format!(
            "## 第二步：技术指标解读\n\n以下信号仪表盘由程序根据最新K线计算，\
             请解读其含义，不要重新计算任何数值：\n\n{}\n\n\
             请说明各维度之间是相互印证还是相互矛盾，并给出技术面的整体倾向。",
            ctx.dashboard.render()
        )
    }

    fn parse(&self, output: &str, ctx: &mut ChainContext) -> PipelineResult<()> {
        require_text(self.name(), output)?;
        ctx.artifacts.insert(self.name().into(), Value::String(output.to_string()));
        ctx.remember(MemoryKey::TechnicalInsight, output);
        Ok(())
    }
}

// -- Multi-period -----------------------------------------------------------

pub struct PeriodStep;

impl ChainStep for PeriodStep {
    fn name(&self) -> &'static str {
        "multi_period"
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn memory_inputs(&self) -> &'static [MemoryKey] {
        &[MemoryKey::TechnicalInsight]
    }

    fn build_prompt(&self, ctx: &ChainContext) -> String {
        format!(
            "## 第三步：多周期验证\n\n{}{}\n\
             请判断日线结论是否得到周线、月线的支持。\
             当日线与周线方向冲突时，以更高周期为准。",
            period_row("周线", ctx.analysis.weekly.last()),
            period_row("月线", ctx.analysis.monthly.last()),
        )
    }

    fn parse(&self, output: &str, ctx: &mut ChainContext) -> PipelineResult<()> {
        require_text(self.name(), output)?;
        ctx.artifacts.insert(self.name().into(), Value::String(output.to_string()));
        ctx.remember(MemoryKey::PeriodInsight, output);
        Ok(())
    }
}

// -- Synthesis --------------------------------------------------------------

pub struct SynthesisStep;

/// JSON shape every predicting model is asked to return.
pub const OUTPUT_CONTRACT: &str = r#"{
  "signal": "Long | Short | Side",
  "confidence": 0.0,
  "summary": "一句话结论",
  "reasoning_trace": [{"step": "维度", "data": "依据", "conclusion": "结论"}],
  "key_levels": {"support": 0.0, "resistance": 0.0, "stop_loss": 0.0},
  "tactics": {
    "holding": [{"priority": "P1", "action": "", "trigger": "", "reason": ""}],
    "empty": [],
    "general": []
  },
  "news_analysis": [],
  "conflict_resolution": "多空矛盾如何取舍",
  "tomorrow_focus": "明日重点观察"
}"#;

impl SynthesisStep {
    fn lite_instruction(ctx: &ChainContext) -> String {
        let (signal, confidence) = translate_confluence(ctx.dashboard.confluence);
        format!(
            "【翻译模式】信号已由程序根据共振评分 {:+} 确定为 {}，置信度 {:.2}。\
             你不得更改 signal 与 confidence，只需围绕这一方向填写 summary 与 tactics。",
            ctx.dashboard.confluence,
            signal.as_str(),
            confidence
        )
    }
}

impl ChainStep for SynthesisStep {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    fn temperature(&self) -> f32 {
        0.1
    }

    fn memory_inputs(&self) -> &'static [MemoryKey] {
        &[
            MemoryKey::AnchorSummary,
            MemoryKey::TechnicalInsight,
            MemoryKey::PeriodInsight,
        ]
    }

    fn json_output(&self) -> bool {
        true
    }

    fn build_prompt(&self, ctx: &ChainContext) -> String {
        let levels = &ctx.key_levels;
        let mut prompt = format!(
            "## 第四步：综合决策\n\n\
             ### 程序计算的关键价位\n- 支撑（布林下轨）：{:.2}\n- 压力（10日最高）：{:.2}\n- 止损（支撑 × 0.97）：{:.2}\n\n\
             ### 你的历史战绩\n{}\n\
             ### 决策规则\n\
             - 默认输出 Side。只有在多周期共振、存在催化剂且成交量确认三者同时成立时，才允许输出 Long 或 Short。\n\
             - confidence 取值 0 到 1。\n\
             - 只输出一个 JSON 对象，不要任何额外文字。\n\n",
            levels.support,
            levels.resistance,
            levels.stop_loss,
            ctx.analysis.history_summary()
        );
        if ctx.lite {
            prompt.push_str(&Self::lite_instruction(ctx));
            prompt.push_str("\n\n");
        }
        prompt.push_str("### 输出格式\n");
        prompt.push_str(OUTPUT_CONTRACT);
        prompt
    }

    fn parse(&self, output: &str, ctx: &mut ChainContext) -> PipelineResult<()> {
        let mut map = extract_json_object(output).ok_or_else(|| {
            PipelineError::Parse("synthesis output contains no JSON object".to_string())
        })?;

        let fixed = ctx.lite.then(|| translate_confluence(ctx.dashboard.confluence));
        if let Some((signal, confidence)) = fixed {
            map.insert("signal".into(), json!(signal.as_str()));
            map.insert("confidence".into(), json!(confidence));
        }

        let mut payload = PredictionPayload::from_value_with_defaults(
            &Value::Object(map),
            &ctx.key_levels,
            &ctx.default_tactics,
        )?;
        if let Some((signal, confidence)) = fixed {
            payload.signal = signal;
            payload.confidence = confidence;
        }

        ctx.artifacts.insert(self.name().into(), payload.to_value());
        ctx.result = Some(payload);
        Ok(())
    }
}
