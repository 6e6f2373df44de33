pub mod calendar;
pub mod config;
pub mod context;
pub mod error;
pub mod json_extract;
pub mod prediction;
pub mod types;

pub use calendar::{MarketClock, TradingCalendar, WeekdayCalendar};
pub use config::{DbSource, PipelineConfig, ProviderConfig, ProviderKind};
pub use context::*;
pub use error::*;
pub use json_extract::extract_json_object;
pub use prediction::*;
pub use types::*;
