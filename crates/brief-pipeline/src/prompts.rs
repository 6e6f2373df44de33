use pipeline_core::{Signal, Tier};
use serde_json::Value;

use crate::news::NewsArticle;

/// Everything phase 1 knows about one symbol on the brief date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StockFacts {
    pub symbol: String,
    pub name: String,
    pub close: Option<f64>,
    pub change_percent: Option<f64>,
    pub signal: Option<Signal>,
    pub confidence: Option<f64>,
    /// Condensed reasoning of the primary prediction.
    pub reasoning: Option<String>,
}

impl StockFacts {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.symbol
        } else {
            &self.name
        }
    }
}

/// Summary plus step conclusions from a stored `ai_reasoning` JSON.
pub fn reasoning_reference(ai_reasoning: &str) -> Option<String> {
    let value: Value = serde_json::from_str(ai_reasoning).ok()?;
    let mut parts = Vec::new();
    if let Some(summary) = value.get("summary").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        parts.push(summary.to_string());
    }
    if let Some(steps) = value.get("reasoning_trace").and_then(Value::as_array) {
        parts.extend(
            steps
                .iter()
                .filter_map(|s| s.get("conclusion").and_then(Value::as_str))
                .filter(|c| !c.is_empty())
                .map(|c| format!("- {}", c)),
        );
    }
    if let Some(focus) = value.get("tomorrow_focus").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        parts.push(format!("明日关注：{}", focus));
    }
    (!parts.is_empty()).then(|| parts.join("\n"))
}

pub fn system_prompt(tier: Tier) -> &'static str {
    match tier {
        Tier::Free => {
            "你是一名亲切的财经助理，为普通投资者用简短、通俗的语言解读自选股。\
             你只依据用户提供的事实写作，绝不编造新闻或数据。"
        }
        Tier::Pro => {
            "你是一名资深财经媒体的首席专栏作家，为专业投资者撰写有深度、有观点的个股点评。\
             你只依据用户提供的事实写作，绝不编造新闻或数据。"
        }
    }
}

pub fn user_prompt(tier: Tier, facts: &StockFacts, news: &[NewsArticle]) -> String {
    let mut out = format!("# {}（{}）\n\n## 第一事实：今日行情与 AI 信号\n", facts.display_name(), facts.symbol);

    match (facts.close, facts.change_percent) {
        (Some(close), Some(change)) => out.push_str(&format!("- 收盘价 {:.2}，涨跌幅 {:+.2}%\n", close, change)),
        (Some(close), None) => out.push_str(&format!("- 收盘价 {:.2}\n", close)),
        _ => out.push_str("- 今日行情暂缺\n"),
    }
    match (facts.signal, facts.confidence) {
        (Some(signal), Some(confidence)) => out.push_str(&format!(
            "- AI 信号：{}（{}），置信度 {:.0}%\n",
            signal.label_zh(),
            signal.as_str(),
            confidence * 100.0
        )),
        _ => out.push_str("- AI 信号：今日暂无\n"),
    }

    out.push_str("\n## 第二事实：近期新闻\n");
    if news.is_empty() {
        out.push_str("- 暂无相关新闻\n");
    }
    for article in news {
        let date = article.published_at.get(..10).unwrap_or(&article.published_at);
        out.push_str(&format!("- [{}] {}", date, article.title));
        if !article.summary.is_empty() {
            out.push_str(&format!("：{}", article.summary));
        }
        out.push('\n');
    }

    if let Some(reasoning) = &facts.reasoning {
        out.push_str("\n## 辅助参考：AI 推理摘要\n");
        out.push_str(reasoning);
        out.push('\n');
    }

    out.push_str("\n## 写作要求\n");
    match tier {
        Tier::Free => out.push_str("- 150 字以内，先给结论再说原因，语言通俗。\n"),
        Tier::Pro => out.push_str(
            "- 400 字以内，分为「核心观点」「消息面」「操作思路」三个小节。\n\
             - 观点鲜明，明确写出多空判断的依据与需要警惕的风险。\n",
        ),
    }
    out.push_str(
        "- 严禁引用任何技术指标的具体数值（如均线、RSI、MACD、KDJ、布林带的读数），只描述方向与含义。\n\
         - 没有新闻时不要编造消息面内容。\n\
         - 使用 Markdown 输出正文，不要输出标题以外的多余说明。\n",
    );
    out
}
