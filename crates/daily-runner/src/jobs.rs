use std::collections::BTreeSet;

use anyhow::Result;
use notification_service::{FlushReport, MorningCall, NotificationManager};
use pipeline_core::Signal;
use prediction_engine::{BatchOutcome, RaceReport};
use serde_json::{json, Value};
use task_logger::{dashboard, DashboardView};

use crate::app::App;

fn flush_summary(report: &FlushReport) -> Value {
    json!({
        "delivered": report.delivered,
        "suppressed": report.suppressed,
        "failed": report.failed,
        "skipped": report.skipped,
        "states_written": report.states_written,
    })
}

fn log_dashboard(view: &DashboardView) {
    for job in &view.jobs {
        tracing::info!(
            task = %job.task.name,
            agent = %job.task.agent_id,
            expected = %job.task.expected_start.format("%H:%M"),
            state = ?job.state,
            latency_min = ?job.latency_minutes,
            blocked_by = ?job.blocked_by,
            "{}",
            job.task.display
        );
    }
    if let Some((task, minutes)) = &view.longest_latency {
        tracing::info!(task = %task, minutes, "longest latency");
    }
}

pub async fn plan(app: &App, date: &str) -> Result<Value> {
    let seeded = app.plan.seed(&app.store, date).await?;
    let view = dashboard(&app.store, &app.plan, date).await?;
    log_dashboard(&view);
    Ok(json!({ "seeded": seeded }))
}

pub async fn status(app: &App, date: &str) -> Result<DashboardView> {
    let view = dashboard(&app.store, &app.plan, date).await?;
    log_dashboard(&view);
    Ok(view)
}

/// Adjudicate calls targeting `date`, then tell watchers about primaries
/// that came true.
pub async fn validate(app: &App, date: &str) -> Result<Value> {
    let report = app.validator().validate_date(date).await?;

    let mut glory = Value::Null;
    if !report.glory.is_empty() {
        let symbols: Vec<String> = report.glory.iter().map(|p| p.symbol.clone()).collect();
        let watchers = app.store.watchers_of(&symbols).await?;
        let mut manager = NotificationManager::new(app.dispatcher.clone(), date);
        for prediction in &report.glory {
            for user_id in watchers.get(&prediction.symbol).into_iter().flatten() {
                manager.queue_validation_glory(
                    user_id,
                    &prediction.symbol,
                    prediction.signal,
                    prediction.actual_change.unwrap_or_default(),
                );
            }
        }
        glory = flush_summary(&manager.flush().await?);
    }

    Ok(json!({
        "correct": report.correct,
        "incorrect": report.incorrect,
        "awaiting_candle": report.awaiting_candle,
        "failed": report.failed,
        "glory": glory,
    }))
}

/// Race every model for each symbol, then check watchers for signal flips.
pub async fn analyze(app: &App, date: &str, symbols: Option<Vec<String>>, force: bool) -> Result<Value> {
    let symbols = match symbols {
        Some(symbols) => symbols,
        None => app.store.watchlist_universe().await?,
    };
    if symbols.is_empty() {
        tracing::info!("no watched symbols to analyze");
        return Ok(json!({ "symbols": 0 }));
    }

    let outcomes = app
        .racer()
        .run_batch(&symbols, Some(date), force, app.config.analysis_concurrency)
        .await;

    let mut reports = Vec::new();
    let (mut data_missing, mut failed) = (0, 0);
    for (symbol, outcome) in outcomes {
        match outcome {
            BatchOutcome::Completed(report) => reports.push(report),
            BatchOutcome::DataMissing(_) => data_missing += 1,
            BatchOutcome::Failed(reason) => {
                tracing::warn!(symbol = %symbol, "analysis failed: {}", reason);
                failed += 1;
            }
        }
    }
    let saved: usize = reports.iter().map(|r| r.saved.len()).sum();
    let notifications = notify_flips(app, date, &reports, force).await?;

    Ok(json!({
        "symbols": symbols.len(),
        "completed": reports.len(),
        "data_missing": data_missing,
        "failed": failed,
        "predictions_saved": saved,
        "notifications": notifications,
    }))
}

async fn notify_flips(app: &App, date: &str, reports: &[RaceReport], forced: bool) -> Result<Value> {
    let symbols: Vec<String> = reports
        .iter()
        .filter(|r| r.primary.is_some())
        .map(|r| r.symbol.clone())
        .collect();
    if symbols.is_empty() {
        return Ok(Value::Null);
    }
    let watchers = app.store.watchers_of(&symbols).await?;
    let user_ids: Vec<String> = watchers
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut manager = NotificationManager::new(app.dispatcher.clone(), date);
    manager.load_signal_states(&user_ids, &symbols).await?;
    for report in reports {
        let Some(primary) = &report.primary else {
            continue;
        };
        // A forced re-run that rewrote the primary without flipping still
        // tells watchers the call was refreshed.
        let refreshed = forced && report.elected.is_some() && !report.saved.is_empty();
        for user_id in watchers.get(&report.symbol).into_iter().flatten() {
            let flipped = manager.check_signal_flip(user_id, &report.symbol, primary.signal, primary.confidence);
            if !flipped && refreshed {
                manager.queue_prediction_updated(user_id, &report.symbol, primary.signal, primary.confidence);
            }
        }
    }
    Ok(flush_summary(&manager.flush().await?))
}

pub async fn brief_phase1(app: &App, date: &str, symbols: Option<Vec<String>>) -> Result<Value> {
    let report = app
        .analyzer()?
        .run(date, symbols, app.config.brief_concurrency)
        .await?;
    let failed: Vec<String> = report
        .failed
        .iter()
        .map(|(symbol, tier, reason)| format!("{}/{}: {}", symbol, tier.as_str(), reason))
        .collect();
    Ok(json!({
        "symbols": report.symbols,
        "written": report.written,
        "failed": failed,
    }))
}

pub async fn brief_phase2(app: &App, date: &str) -> Result<Value> {
    let report = app.assembler().run(date).await?;
    Ok(json!({
        "assembled": report.assembled,
        "skipped": report.skipped,
        "failed": report.failed,
        "notified": report.notified,
    }))
}

/// Summarise each user's calls targeting `date`, strongest first.
pub async fn morning_call(app: &App, date: &str) -> Result<Value> {
    let mut manager = NotificationManager::new(app.dispatcher.clone(), date);
    let mut users = 0;

    for (user, watchlist) in app.store.users_with_watchlists().await? {
        let calls = app.store.primary_predictions_targeting(&watchlist, date).await?;
        if calls.is_empty() {
            continue;
        }
        let mut ranked: Vec<_> = calls.values().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut call = MorningCall {
            total: watchlist.len(),
            ..Default::default()
        };
        for prediction in ranked {
            match prediction.signal {
                Signal::Long => call.bullish.push(prediction.symbol.clone()),
                Signal::Short => call.bearish.push(prediction.symbol.clone()),
                Signal::Side => {}
            }
        }
        manager.queue_morning_call(&user.user_id, call);
        users += 1;
    }

    let report = manager.flush().await?;
    Ok(json!({ "users": users, "notifications": flush_summary(&report) }))
}

/// Broadcast that the date's prices are in. Nothing is sent before any
/// candle for the date exists.
pub async fn price_update(app: &App, date: &str) -> Result<Value> {
    let count = app.store.priced_symbol_count(date).await?;
    if count == 0 {
        tracing::info!(date, "no prices for date, broadcast skipped");
        return Ok(json!({ "symbols": 0, "sent": false }));
    }
    let outcome = app.dispatcher.broadcast_price_update(date, count as usize).await;
    Ok(json!({ "symbols": count, "sent": outcome.delivered() }))
}
