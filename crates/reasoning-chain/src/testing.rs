//! Shared fixtures for this crate's tests.

use pipeline_core::{AccuracyStats, AnalysisContext, Market, StockMeta};

use crate::dashboard::tests::bullish_pair;

pub(crate) fn context() -> AnalysisContext {
    let daily = bullish_pair();
    AnalysisContext {
        symbol: "00700".into(),
        market: Market::HK,
        analysis_date: "2026-01-02".into(),
        profile: Some(StockMeta {
            symbol: "00700".into(),
            name: "腾讯控股".into(),
            market: Market::HK,
            last_updated: None,
            industry: Some("互联网".into()),
            main_business: Some("社交与游戏".into()),
            description: None,
        }),
        weekly: daily.clone(),
        monthly: daily.clone(),
        daily,
        history_model_id: None,
        history: Vec::new(),
        accuracy: AccuracyStats::default(),
        market_mood: None,
    }
}
