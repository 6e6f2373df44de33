use pipeline_core::{PredictionPayload, Signal};

/// Directional calls below this confidence are downgraded to Side.
pub const MIN_DIRECTIONAL_CONFIDENCE: f64 = 0.75;
pub const DOWNGRADED_CONFIDENCE: f64 = 0.5;
pub const RISK_CONTROL_TAG: &str = "[系统风控]";

/// Downgrade a weak Long/Short to Side @ 0.5. Returns true when it fired.
pub fn apply_circuit_breaker(payload: &mut PredictionPayload) -> bool {
    if !payload.signal.is_directional() || payload.confidence >= MIN_DIRECTIONAL_CONFIDENCE {
        return false;
    }
    let original = payload.signal;
    let original_confidence = payload.confidence;
    payload.signal = Signal::Side;
    payload.confidence = DOWNGRADED_CONFIDENCE;
    payload.summary = format!(
        "{} 原始信号 {}（置信度 {:.2}）未达 {:.2} 门槛，已降级为观望。{}",
        RISK_CONTROL_TAG,
        original.label_zh(),
        original_confidence,
        MIN_DIRECTIONAL_CONFIDENCE,
        payload.summary
    );
    true
}

/// Lite translator table: signal and confidence fixed by the confluence score.
pub fn translate_confluence(score: i32) -> (Signal, f64) {
    let magnitude = score.abs();
    let direction = if score > 0 { Signal::Long } else { Signal::Short };
    if magnitude >= 4 {
        (direction, 0.85)
    } else if magnitude >= 2 {
        (direction, 0.65)
    } else {
        (Signal::Side, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let mut at = PredictionPayload::new(Signal::Long, 0.75, "ok");
        assert!(!apply_circuit_breaker(&mut at));
        assert_eq!(at.signal, Signal::Long);

        let mut below = PredictionPayload::new(Signal::Long, 0.7499, "thin");
        assert!(apply_circuit_breaker(&mut below));
        assert_eq!(below.signal, Signal::Side);
        assert_eq!(below.confidence, 0.5);
        assert!(below.summary.starts_with("[系统风控]"));
        assert!(below.summary.ends_with("thin"));
    }

    #[test]
    fn side_passes_untouched() {
        let mut side = PredictionPayload::new(Signal::Side, 0.3, "wait");
        assert!(!apply_circuit_breaker(&mut side));
        assert_eq!(side.summary, "wait");
    }

    #[test]
    fn lite_downgrade_of_weak_long() {
        let mut p = PredictionPayload::new(Signal::Long, 0.70, "突破在即");
        apply_circuit_breaker(&mut p);
        assert_eq!((p.signal, p.confidence), (Signal::Side, 0.5));
        assert!(p.summary.starts_with(RISK_CONTROL_TAG));
    }

    #[test]
    fn translator_table() {
        assert_eq!(translate_confluence(4), (Signal::Long, 0.85));
        assert_eq!(translate_confluence(3), (Signal::Long, 0.65));
        assert_eq!(translate_confluence(-2), (Signal::Short, 0.65));
        assert_eq!(translate_confluence(-5), (Signal::Short, 0.85));
        assert_eq!(translate_confluence(1), (Signal::Side, 0.5));
        assert_eq!(translate_confluence(0), (Signal::Side, 0.5));
    }
}
