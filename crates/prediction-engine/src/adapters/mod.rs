mod chain;
mod llm;
mod rule;
mod skip;

pub use chain::ChainAdapter;
pub use llm::{LlmAdapter, SINGLE_SHOT_ATTEMPTS};
pub use rule::RuleAdapter;
pub use skip::SkipAdapter;
