use pipeline_core::{Period, PipelineResult, Prediction, Signal, ValidationStatus};
use sql_store::Store;

/// Default tolerance, in percent, inside which a Side call counts as right.
pub const DEFAULT_NOISE_THRESHOLD: f64 = 1.0;

/// Side is asymmetric: any drop counts as risk avoided, only a rise past the
/// threshold is a missed move.
pub fn adjudicate(signal: Signal, change: f64, noise_threshold: f64) -> ValidationStatus {
    let correct = match signal {
        Signal::Long => change > 0.0,
        Signal::Short => change < 0.0,
        Signal::Side => change <= noise_threshold,
    };
    if correct {
        ValidationStatus::Correct
    } else {
        ValidationStatus::Incorrect
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub target_date: String,
    pub correct: usize,
    pub incorrect: usize,
    /// Symbols with pending rows but no candle for the target date yet.
    pub awaiting_candle: Vec<String>,
    /// Primary rows that turned Correct in this pass.
    pub glory: Vec<Prediction>,
    /// `(symbol, error)` for symbols whose rows could not be adjudicated.
    pub failed: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn validated(&self) -> usize {
        self.correct + self.incorrect
    }
}

pub struct Validator {
    store: Store,
    noise_threshold: f64,
}

impl Validator {
    pub fn new(store: Store, noise_threshold: f64) -> Self {
        Self {
            store,
            noise_threshold,
        }
    }

    /// Adjudicate every model's pending rows for `symbol` that target
    /// `target_date`. Returns `false` when that day's candle is not in yet.
    pub async fn validate_symbol(
        &self,
        symbol: &str,
        target_date: &str,
        report: &mut ValidationReport,
    ) -> PipelineResult<bool> {
        let Some(candle) = self.store.candle_on(Period::Daily, symbol, target_date).await? else {
            return Ok(false);
        };
        let change = candle.change_percent;

        for row in self.store.pending_for_target(symbol, target_date).await? {
            let status = adjudicate(row.signal, change, self.noise_threshold);
            if !self.store.apply_validation(&row, status, change).await? {
                continue;
            }
            tracing::debug!(
                symbol,
                date = %row.date,
                model_id = %row.model_id,
                signal = row.signal.as_str(),
                change,
                status = status.as_str(),
                "prediction validated"
            );
            match status {
                ValidationStatus::Correct => {
                    report.correct += 1;
                    if row.is_primary {
                        report.glory.push(Prediction {
                            validation_status: status,
                            actual_change: Some(change),
                            ..row
                        });
                    }
                }
                _ => report.incorrect += 1,
            }
        }
        Ok(true)
    }

    /// Sweep every symbol with pending rows targeting `target_date`.
    pub async fn validate_date(&self, target_date: &str) -> PipelineResult<ValidationReport> {
        let mut report = ValidationReport {
            target_date: target_date.to_string(),
            ..Default::default()
        };
        for symbol in self.store.symbols_pending_for_target(target_date).await? {
            match self.validate_symbol(&symbol, target_date, &mut report).await {
                Ok(true) => {}
                Ok(false) => report.awaiting_candle.push(symbol),
                Err(e) => {
                    tracing::warn!(symbol = %symbol, target_date, "validation failed: {}", e);
                    report.failed.push((symbol, e.to_string()));
                }
            }
        }
        tracing::info!(
            target_date,
            correct = report.correct,
            incorrect = report.incorrect,
            awaiting = report.awaiting_candle.len(),
            failed = report.failed.len(),
            "validation pass complete"
        );
        Ok(report)
    }
}
