use crate::steps::{AnchorStep, ChainStep, IndicatorStep, PeriodStep, SynthesisStep};

/// Named, ordered list of steps plus the system prompt they share.
pub struct Strategy {
    name: String,
    system_prompt: String,
    steps: Vec<Box<dyn ChainStep>>,
}

pub const FOUR_STEP: &str = "four_step";

const ANALYST_SYSTEM_PROMPT: &str = "你是一名严谨、保守的证券技术分析师。\
你只依据用户提供的数据进行分析，绝不编造价格、新闻或财务数据。\
当证据不足或相互矛盾时，你倾向于观望。";

/// Appended to every step prompt.
pub const RULE_CODA: &str = "\n\n【规则】请逐步思考；结论保持保守，证据不足时倾向观望；\
只使用上文提供的数据，不得编造任何数据。";

impl Strategy {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl ChainStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Anchor → indicator → multi-period → synthesis.
    pub fn four_step() -> Self {
        Self::new(FOUR_STEP, ANALYST_SYSTEM_PROMPT)
            .step(AnchorStep)
            .step(IndicatorStep)
            .step(PeriodStep)
            .step(SynthesisStep)
    }

    /// Resolve a strategy name from model config; unknown names yield `None`.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim() {
            "" | FOUR_STEP | "default" | "standard" => Some(Self::four_step()),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn steps(&self) -> &[Box<dyn ChainStep>] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_step_order() {
        let strategy = Strategy::by_name("four_step").unwrap();
        let names: Vec<&str> = strategy.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["anchor", "indicator", "multi_period", "synthesis"]);
        assert!(Strategy::by_name("tree_of_thought").is_none());
    }
}
