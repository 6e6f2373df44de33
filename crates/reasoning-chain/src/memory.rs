use std::collections::BTreeMap;

use llm_client::ChatMessage;
use pipeline_core::{preview, AnalysisContext, KeyLevels, PredictionPayload, Tactics};
use serde_json::{Map, Value};

use crate::dashboard::{default_tactics, key_levels, SignalDashboard};

/// Distilled conclusion slots, one per completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryKey {
    AnchorSummary,
    TechnicalInsight,
    PeriodInsight,
}

impl MemoryKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKey::AnchorSummary => "anchor_summary",
            MemoryKey::TechnicalInsight => "technical_insight",
            MemoryKey::PeriodInsight => "period_insight",
        }
    }

    pub fn label_zh(&self) -> &'static str {
        match self {
            MemoryKey::AnchorSummary => "数据锚定结论",
            MemoryKey::TechnicalInsight => "技术面结论",
            MemoryKey::PeriodInsight => "多周期结论",
        }
    }

    /// Characters kept when a step's output is distilled into memory.
    pub fn budget(&self) -> usize {
        match self {
            MemoryKey::AnchorSummary => 300,
            MemoryKey::TechnicalInsight => 1500,
            MemoryKey::PeriodInsight => 800,
        }
    }
}

/// State threaded through one chain execution.
pub struct ChainContext {
    pub analysis: AnalysisContext,
    pub lite: bool,
    pub dashboard: SignalDashboard,
    pub key_levels: KeyLevels,
    pub default_tactics: Tactics,
    /// Every prompt and reply, for debugging only; never replayed to the model.
    pub messages: Vec<ChatMessage>,
    pub artifacts: Map<String, Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub step_durations: Vec<(String, u64)>,
    pub result: Option<PredictionPayload>,
    memory: BTreeMap<MemoryKey, String>,
}

impl ChainContext {
    pub fn new(analysis: AnalysisContext, lite: bool) -> Self {
        let dashboard = SignalDashboard::compute(&analysis.daily);
        let levels = key_levels(&analysis.daily);
        Self {
            default_tactics: default_tactics(&levels),
            key_levels: levels,
            dashboard,
            analysis,
            lite,
            messages: Vec::new(),
            artifacts: Map::new(),
            tokens_in: 0,
            tokens_out: 0,
            step_durations: Vec::new(),
            result: None,
            memory: BTreeMap::new(),
        }
    }

    pub fn remember(&mut self, key: MemoryKey, text: &str) {
        self.memory
            .insert(key, preview(text.trim(), key.budget()));
    }

    pub fn recall(&self, key: MemoryKey) -> Option<&str> {
        self.memory.get(&key).map(String::as_str)
    }

    /// Memory block for the selected predecessors, in key order.
    pub fn recall_block(&self, keys: &[MemoryKey]) -> String {
        let mut out = String::new();
        for key in keys {
            if let Some(text) = self.recall(*key) {
                out.push_str(&format!("【{}】\n{}\n\n", key.label_zh(), text));
            }
        }
        out
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}
