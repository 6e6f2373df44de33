use serde::{Deserialize, Serialize};

/// Directional call for the next trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    Side,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Long => "Long",
            Signal::Short => "Short",
            Signal::Side => "Side",
        }
    }

    /// Lenient parse used on LLM output and stored rows.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" | "bullish" | "看多" | "做多" => Some(Signal::Long),
            "short" | "sell" | "bearish" | "看空" | "做空" => Some(Signal::Short),
            "side" | "hold" | "neutral" | "观望" | "中性" => Some(Signal::Side),
            _ => None,
        }
    }

    /// Chinese label used in narrative text.
    pub fn label_zh(&self) -> &'static str {
        match self {
            Signal::Long => "看多",
            Signal::Short => "看空",
            Signal::Side => "观望",
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Signal::Side)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle periodicity; each maps to its own price table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn table(&self) -> &'static str {
        match self {
            Period::Daily => "daily_prices",
            Period::Weekly => "weekly_prices",
            Period::Monthly => "monthly_prices",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    CN,
    HK,
    US,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::CN => "CN",
            Market::HK => "HK",
            Market::US => "US",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CN" | "A" | "SH" | "SZ" => Some(Market::CN),
            "HK" => Some(Market::HK),
            "US" => Some(Market::US),
            _ => None,
        }
    }

    /// Infer the market from the symbol shape: 6 digits are A-shares,
    /// up to 5 digits are Hong Kong listings, anything else trades in the US.
    pub fn infer(symbol: &str) -> Self {
        let s = symbol.trim();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if s.len() == 6 {
                Market::CN
            } else {
                Market::HK
            }
        } else {
            Market::US
        }
    }
}

/// Precomputed indicator set stored alongside every candle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub ma5: f64,
    pub ma10: f64,
    pub ma20: f64,
    pub ma60: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub boll_upper: f64,
    pub boll_mid: f64,
    pub boll_lower: f64,
    pub rsi: f64,
    pub kdj_k: f64,
    pub kdj_d: f64,
    pub kdj_j: f64,
}

impl Indicators {
    /// Indicator columns are written all-or-nothing; an all-zero row means
    /// the history was too short when the candle was ingested.
    pub fn is_populated(&self) -> bool {
        [
            self.ma5,
            self.ma10,
            self.ma20,
            self.boll_mid,
            self.rsi,
            self.kdj_k,
        ]
        .iter()
        .any(|v| *v != 0.0)
    }
}

/// OHLCV bar with indicators for one (period, symbol, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub change_percent: f64,
    #[serde(flatten)]
    pub indicators: Indicators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMeta {
    pub symbol: String,
    pub name: String,
    pub market: Market,
    pub last_updated: Option<String>,
    pub industry: Option<String>,
    pub main_business: Option<String>,
    pub description: Option<String>,
}

/// Registered prediction provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionModel {
    pub model_id: String,
    pub display_name: String,
    pub provider: String,
    pub is_active: bool,
    pub priority: i64,
    pub config: serde_json::Value,
    pub capabilities: serde_json::Value,
    pub created_at: Option<String>,
}

impl PredictionModel {
    fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// LLM provider id this model routes to (defaults to the provider tag).
    pub fn provider_id(&self) -> &str {
        self.config_str("provider_id").unwrap_or(&self.provider)
    }

    /// Reasoning-chain strategy name for chain-backed models.
    pub fn strategy(&self) -> Option<&str> {
        self.config_str("strategy")
    }

    pub fn is_lite(&self) -> bool {
        self.config
            .get("lite")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Pending,
    Correct,
    Incorrect,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "Pending",
            ValidationStatus::Correct => "Correct",
            ValidationStatus::Incorrect => "Incorrect",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "Correct" => ValidationStatus::Correct,
            "Incorrect" => ValidationStatus::Incorrect,
            _ => ValidationStatus::Pending,
        }
    }
}

/// One row of `ai_predictions_v2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: String,
    pub date: String,
    pub model_id: String,
    pub target_date: String,
    pub signal: Signal,
    pub confidence: f64,
    pub support_price: Option<f64>,
    pub pressure_price: Option<f64>,
    pub ai_reasoning: Option<String>,
    pub token_usage_input: i64,
    pub token_usage_output: i64,
    pub execution_time_ms: i64,
    pub validation_status: ValidationStatus,
    pub actual_change: Option<f64>,
    pub is_primary: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Subscription class. Unknown tiers resolve to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Free,
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Free, Tier::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pro" | "premium" => Tier::Pro,
            _ => Tier::Free,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub subscription_tier: String,
    pub subscription_expires_at: Option<String>,
    pub notification_settings: Option<String>,
}

impl User {
    /// Effective tier on `today`: an expired subscription falls back to free.
    pub fn effective_tier(&self, today: &str) -> Tier {
        let tier = Tier::parse(&self.subscription_tier);
        match (&tier, self.subscription_expires_at.as_deref()) {
            (Tier::Pro, Some(expires)) if !expires.is_empty() && &expires[..expires.len().min(10)] < today => {
                Tier::Free
            }
            _ => tier,
        }
    }
}

/// Per-symbol tiered narrative produced by brief phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBrief {
    pub symbol: String,
    pub date: String,
    pub tier: Tier,
    pub stock_name: String,
    pub analysis_markdown: String,
    pub raw_news: Option<String>,
    pub signal: Option<Signal>,
    pub confidence: Option<f64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBrief {
    pub user_id: String,
    pub date: String,
    pub content: String,
    pub push_hook: String,
    pub notified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    pub user_id: String,
    pub symbol: String,
    pub last_signal: Signal,
    pub last_confidence: f64,
    pub last_notified_at: Option<String>,
}

/// Status of one executed chain or brief synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Success => "success",
            TraceStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    pub step: String,
    pub duration_ms: u64,
    pub tokens: u64,
    pub attempts: u32,
    pub prompt_preview: String,
    pub output_preview: String,
}

/// Durable record of one reasoning-chain execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTrace {
    pub trace_id: String,
    pub symbol: String,
    pub date: String,
    pub model_id: String,
    pub strategy_name: String,
    pub steps_executed: Vec<String>,
    pub steps_details: Vec<StepDetail>,
    pub artifacts: serde_json::Map<String, serde_json::Value>,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub retry_count: u32,
    pub final_result: Option<serde_json::Value>,
    pub status: TraceStatus,
    pub error_step: Option<String>,
    pub error_reason: Option<String>,
}

/// Cut a string to at most `max_chars` characters without splitting a code point.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_inference() {
        assert_eq!(Market::infer("600519"), Market::CN);
        assert_eq!(Market::infer("00700"), Market::HK);
        assert_eq!(Market::infer("AAPL"), Market::US);
    }

    #[test]
    fn signal_parse_is_lenient() {
        assert_eq!(Signal::parse(" long "), Some(Signal::Long));
        assert_eq!(Signal::parse("SELL"), Some(Signal::Short));
        assert_eq!(Signal::parse("观望"), Some(Signal::Side));
        assert_eq!(Signal::parse("maybe"), None);
    }

    #[test]
    fn expired_pro_is_free() {
        let mut user = User {
            user_id: "u1".into(),
            subscription_tier: "pro".into(),
            subscription_expires_at: Some("2026-01-01".into()),
            notification_settings: None,
        };
        assert_eq!(user.effective_tier("2026-01-02"), Tier::Free);
        assert_eq!(user.effective_tier("2025-12-31"), Tier::Pro);
        user.subscription_expires_at = None;
        assert_eq!(user.effective_tier("2030-01-01"), Tier::Pro);
        user.subscription_tier = "enterprise".into();
        assert_eq!(user.effective_tier("2030-01-01"), Tier::Free);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("腾讯控股", 2), "腾讯");
        assert_eq!(preview("abc", 10), "abc");
    }
}
