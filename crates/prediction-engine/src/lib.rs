//! Context building, model adapters, the per-(symbol, date) prediction race
//! and next-day validation.

mod adapter;
pub mod adapters;
pub mod context;
pub mod racer;
pub mod resolver;
pub mod validator;

#[cfg(test)]
mod testing;

pub use adapter::{AdapterOutcome, AdapterOutput, PredictionAdapter};
pub use context::ContextBuilder;
pub use racer::{BatchOutcome, PredictionRacer, RaceReport};
pub use resolver::AdapterResolver;
pub use validator::{adjudicate, ValidationReport, Validator, DEFAULT_NOISE_THRESHOLD};
