use serde::{Deserialize, Serialize};

use crate::types::{Candle, Market, Signal, StockMeta, ValidationStatus};

/// A validated past prediction shown to a model as its own track record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPrediction {
    pub date: String,
    pub target_date: String,
    pub model_id: String,
    pub signal: Signal,
    pub confidence: f64,
    pub validation_status: ValidationStatus,
    pub actual_change: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyStats {
    pub total: i64,
    pub correct: i64,
    /// `correct / total * 100`, zero when nothing has been validated.
    pub accuracy_pct: f64,
}

impl AccuracyStats {
    pub fn new(total: i64, correct: i64) -> Self {
        let accuracy_pct = if total > 0 {
            correct as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total,
            correct,
            accuracy_pct,
        }
    }
}

/// Market breadth for one trading date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketMood {
    pub advancing: i64,
    pub declining: i64,
    pub avg_change: f64,
}

impl MarketMood {
    pub fn describe_zh(&self) -> String {
        let tone = if self.avg_change > 0.8 {
            "普涨"
        } else if self.avg_change > 0.0 {
            "偏暖"
        } else if self.avg_change > -0.8 {
            "偏弱"
        } else {
            "普跌"
        };
        format!(
            "{}（上涨 {} 只 / 下跌 {} 只，平均涨跌幅 {:+.2}%）",
            tone, self.advancing, self.declining, self.avg_change
        )
    }
}

/// Immutable per-(symbol, date) input shared by every model adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub symbol: String,
    pub market: Market,
    pub analysis_date: String,
    pub profile: Option<StockMeta>,
    /// Ten most recent daily candles, oldest first.
    pub daily: Vec<Candle>,
    pub weekly: Vec<Candle>,
    pub monthly: Vec<Candle>,
    /// `None` means the primary-history view.
    pub history_model_id: Option<String>,
    pub history: Vec<HistoricalPrediction>,
    pub accuracy: AccuracyStats,
    pub market_mood: Option<MarketMood>,
}

impl AnalysisContext {
    pub fn latest(&self) -> Option<&Candle> {
        self.daily.last()
    }

    pub fn previous(&self) -> Option<&Candle> {
        let n = self.daily.len();
        if n >= 2 {
            self.daily.get(n - 2)
        } else {
            None
        }
    }

    pub fn stock_name(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.symbol)
    }

    /// Copy of this context carrying another model's track record.
    pub fn with_history(
        &self,
        model_id: Option<String>,
        history: Vec<HistoricalPrediction>,
        accuracy: AccuracyStats,
    ) -> Self {
        let mut ctx = self.clone();
        ctx.history_model_id = model_id;
        ctx.history = history;
        ctx.accuracy = accuracy;
        ctx
    }

    /// Markdown price table of the daily window used in prompts.
    pub fn daily_table(&self) -> String {
        let mut out = String::from("| 日期 | 开盘 | 最高 | 最低 | 收盘 | 涨跌幅 | 成交量 |\n|---|---|---|---|---|---|---|\n");
        for c in &self.daily {
            out.push_str(&format!(
                "| {} | {:.2} | {:.2} | {:.2} | {:.2} | {:+.2}% | {:.0} |\n",
                c.date, c.open, c.high, c.low, c.close, c.change_percent, c.volume
            ));
        }
        out
    }

    /// One-paragraph track record summary.
    pub fn history_summary(&self) -> String {
        if self.history.is_empty() {
            return "暂无已验证的历史预测。".to_string();
        }
        let mut out = format!(
            "近期已验证预测 {} 条，准确率 {:.0}%：\n",
            self.accuracy.total, self.accuracy.accuracy_pct
        );
        for h in &self.history {
            out.push_str(&format!(
                "- {} 预测 {}（置信度 {:.2}）→ {}，实际涨跌 {}\n",
                h.date,
                h.signal,
                h.confidence,
                h.validation_status.as_str(),
                h.actual_change
                    .map(|c| format!("{:+.2}%", c))
                    .unwrap_or_else(|| "-".to_string())
            ));
        }
        out
    }
}
