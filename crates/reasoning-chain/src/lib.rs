//! Multi-step reasoning chain: each step sees only the distilled
//! conclusions of the steps it selects, and every run leaves one trace row.

pub mod breaker;
pub mod dashboard;
pub mod executor;
pub mod memory;
pub mod steps;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use breaker::{apply_circuit_breaker, translate_confluence, MIN_DIRECTIONAL_CONFIDENCE, RISK_CONTROL_TAG};
pub use dashboard::{default_tactics, key_levels, Dimension, SignalDashboard};
pub use executor::{ChainExecutor, ChainOutcome};
pub use memory::{ChainContext, MemoryKey};
pub use steps::{AnchorStep, ChainStep, IndicatorStep, PeriodStep, SynthesisStep, OUTPUT_CONTRACT};
pub use strategy::{Strategy, FOUR_STEP};
