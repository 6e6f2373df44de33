//! Two-phase daily brief: per-symbol tiered narratives written once
//! (phase 1), then assembled per user from the cache and pushed (phase 2).

pub mod analyzer;
pub mod assembler;
pub mod news;
pub mod prompts;

pub use analyzer::{Phase1Report, StockAnalyzer, BRIEF_ATTEMPTS};
pub use assembler::{push_hook, render_content, AssembledBrief, BriefAssembler, Phase2Report};
pub use news::{fetch_news, filter_news, HttpNewsProvider, NewsArticle, NewsProvider};
pub use prompts::{reasoning_reference, system_prompt, user_prompt, StockFacts};
