//! Canonical prediction JSON and the schema normalizer.
//!
//! Every adapter funnels model output through [`normalize_value`] so that the
//! stored `ai_reasoning` always has the same shape regardless of how loosely the
//! model followed instructions. Normalization is a fixed point:
//! `normalize(normalize(x)) == normalize(x)`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::PipelineError;
use crate::types::Signal;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step: String,
    pub data: String,
    pub conclusion: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyLevels {
    pub support: f64,
    pub resistance: f64,
    pub stop_loss: f64,
}

impl KeyLevels {
    pub fn is_empty(&self) -> bool {
        self.support == 0.0 && self.resistance == 0.0 && self.stop_loss == 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tactic {
    pub priority: String,
    pub action: String,
    pub trigger: String,
    pub reason: String,
}

impl Tactic {
    pub fn new(priority: &str, action: &str, trigger: &str, reason: &str) -> Self {
        Self {
            priority: priority.to_string(),
            action: action.to_string(),
            trigger: trigger.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Playbook split by position state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tactics {
    pub holding: Vec<Tactic>,
    pub empty: Vec<Tactic>,
    pub general: Vec<Tactic>,
}

impl Tactics {
    pub fn is_empty(&self) -> bool {
        self.holding.is_empty() && self.empty.is_empty() && self.general.is_empty()
    }
}

/// Typed view of the prediction JSON stored in `ai_reasoning`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPayload {
    pub signal: Signal,
    pub confidence: f64,
    pub summary: String,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub key_levels: KeyLevels,
    pub tactics: Tactics,
    pub news_analysis: Vec<String>,
    pub conflict_resolution: Option<String>,
    pub tomorrow_focus: Option<String>,
}

impl PredictionPayload {
    pub fn new(signal: Signal, confidence: f64, summary: impl Into<String>) -> Self {
        Self {
            signal,
            confidence: clamp_confidence(confidence),
            summary: summary.into(),
            reasoning_trace: Vec::new(),
            key_levels: KeyLevels::default(),
            tactics: Tactics::default(),
            news_analysis: Vec::new(),
            conflict_resolution: None,
            tomorrow_focus: None,
        }
    }

    /// Normalize arbitrary model JSON and require a recognizable signal.
    pub fn from_value(raw: &Value) -> Result<Self, PipelineError> {
        let normalized = normalize_value(raw);
        let signal_ok = normalized
            .get("signal")
            .and_then(|v| v.as_str())
            .and_then(Signal::parse)
            .is_some();
        if !signal_ok {
            return Err(PipelineError::Parse(
                "prediction JSON has no recognizable signal".to_string(),
            ));
        }
        serde_json::from_value(normalized).map_err(|e| PipelineError::Parse(e.to_string()))
    }

    /// Like [`from_value`](Self::from_value), filling absent key levels and
    /// tactics from values computed in code.
    pub fn from_value_with_defaults(
        raw: &Value,
        levels: &KeyLevels,
        tactics: &Tactics,
    ) -> Result<Self, PipelineError> {
        let mut payload = Self::from_value(raw)?;
        payload.backfill(levels, tactics);
        Ok(payload)
    }

    pub fn backfill(&mut self, levels: &KeyLevels, tactics: &Tactics) {
        if self.key_levels.support == 0.0 {
            self.key_levels.support = levels.support;
        }
        if self.key_levels.resistance == 0.0 {
            self.key_levels.resistance = levels.resistance;
        }
        if self.key_levels.stop_loss == 0.0 {
            self.key_levels.stop_loss = levels.stop_loss;
        }
        if self.tactics.is_empty() {
            self.tactics = tactics.clone();
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Canonical string persisted as `ai_reasoning`.
    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }

    pub fn support_price(&self) -> Option<f64> {
        Some(self.key_levels.support).filter(|v| *v > 0.0)
    }

    pub fn pressure_price(&self) -> Option<f64> {
        Some(self.key_levels.resistance).filter(|v| *v > 0.0)
    }
}

pub fn clamp_confidence(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.5;
    }
    let scaled = if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}

/// Coerce a loosely-shaped prediction object into the canonical shape.
pub fn normalize_value(raw: &Value) -> Value {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);

    let signal = match obj.get("signal") {
        Some(Value::String(s)) => Signal::parse(s)
            .map(|sig| Value::String(sig.as_str().to_string()))
            .unwrap_or_else(|| Value::String(s.clone())),
        _ => Value::Null,
    };

    let confidence = obj
        .get("confidence")
        .and_then(as_number)
        .map(clamp_confidence)
        .unwrap_or(0.5);

    json!({
        "signal": signal,
        "confidence": confidence,
        "summary": obj.get("summary").map(as_text).unwrap_or_default(),
        "reasoning_trace": normalize_trace(obj.get("reasoning_trace")),
        "key_levels": normalize_levels(obj.get("key_levels")),
        "tactics": normalize_tactics(obj.get("tactics")),
        "news_analysis": normalize_string_list(obj.get("news_analysis")),
        "conflict_resolution": optional_text(obj.get("conflict_resolution")),
        "tomorrow_focus": optional_text(obj.get("tomorrow_focus")),
    })
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let t = s.trim();
            if let Some(pct) = t.strip_suffix('%') {
                pct.trim().parse::<f64>().ok().map(|p| p / 100.0)
            } else {
                t.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn optional_text(v: Option<&Value>) -> Value {
    match v {
        None | Some(Value::Null) => Value::Null,
        Some(other) => Value::String(as_text(other)),
    }
}

/// Single value → one-element list; null → empty list.
fn as_list(v: Option<&Value>) -> Vec<Value> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn normalize_string_list(v: Option<&Value>) -> Value {
    Value::Array(
        as_list(v)
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| Value::String(as_text(item)))
            .collect(),
    )
}

fn normalize_trace(v: Option<&Value>) -> Value {
    let steps = as_list(v)
        .iter()
        .filter_map(|item| match item {
            Value::Object(o) => Some(json!({
                "step": o.get("step").map(as_text).unwrap_or_default(),
                "data": o.get("data").map(as_text).unwrap_or_default(),
                "conclusion": o.get("conclusion").map(as_text).unwrap_or_default(),
            })),
            Value::Null => None,
            other => Some(json!({
                "step": "",
                "data": "",
                "conclusion": as_text(other),
            })),
        })
        .collect();
    Value::Array(steps)
}

fn normalize_levels(v: Option<&Value>) -> Value {
    let level = |key: &str| -> f64 {
        v.and_then(|o| o.get(key))
            .and_then(as_number)
            .filter(|n| n.is_finite())
            .unwrap_or(0.0)
    };
    json!({
        "support": level("support"),
        "resistance": level("resistance"),
        "stop_loss": level("stop_loss"),
    })
}

fn normalize_tactic_list(v: Option<&Value>) -> Value {
    let items = as_list(v)
        .iter()
        .filter_map(|item| match item {
            Value::Object(o) => Some(json!({
                "priority": o.get("priority").map(as_text).unwrap_or_default(),
                "action": o.get("action").map(as_text).unwrap_or_default(),
                "trigger": o.get("trigger").map(as_text).unwrap_or_default(),
                "reason": o.get("reason").map(as_text).unwrap_or_default(),
            })),
            Value::Null => None,
            other => Some(json!({
                "priority": "",
                "action": as_text(other),
                "trigger": "",
                "reason": "",
            })),
        })
        .collect();
    Value::Array(items)
}

fn normalize_tactics(v: Option<&Value>) -> Value {
    match v {
        Some(Value::Object(o)) => json!({
            "holding": normalize_tactic_list(o.get("holding")),
            "empty": normalize_tactic_list(o.get("empty")),
            "general": normalize_tactic_list(o.get("general")),
        }),
        // A bare list or string of tactics is treated as general advice.
        Some(other) if !other.is_null() => json!({
            "holding": [],
            "empty": [],
            "general": normalize_tactic_list(Some(other)),
        }),
        _ => json!({ "holding": [], "empty": [], "general": [] }),
    }
}
