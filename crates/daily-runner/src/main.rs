use std::future::Future;

use anyhow::{Context, Result};
use pipeline_core::PipelineConfig;
use serde::Serialize;
use task_logger::plan::{ANALYSIS_RACE, BRIEF_PHASE1, BRIEF_PHASE2, MORNING_CALL, VALIDATION};

mod app;
mod args;
mod jobs;

use app::App;
use args::{Job, RunArgs};

const PRICE_UPDATE: &str = "price_update_broadcast";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match args::parse_args(&raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, args::USAGE);
            std::process::exit(2);
        }
    };

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let app = App::build(config, args.dry_run).await?;
    let date = args
        .date
        .clone()
        .unwrap_or_else(|| app.store.clock().today());
    tracing::info!(job = ?args.job, date = %date, dry_run = args.dry_run, force = args.force, "daily-runner starting");

    let result = run(&app, &args, &date).await;
    app.store.close().await;
    if let Err(e) = &result {
        tracing::error!("daily-runner failed: {:#}", e);
    }
    result
}

/// Run `job` under the task logger of its planned task.
async fn tracked<T, F>(app: &App, task: &str, date: &str, job: F) -> Result<T>
where
    T: Serialize,
    F: Future<Output = Result<T>>,
{
    let (display, task_type) = app
        .plan
        .get(task)
        .map(|t| (t.display.clone(), t.task_type.clone()))
        .unwrap_or_else(|| (task.to_string(), "adhoc".to_string()));
    app.logger(task, date).track(&display, &task_type, job).await
}

async fn run(app: &App, args: &RunArgs, date: &str) -> Result<()> {
    match args.job {
        Job::Plan => {
            jobs::plan(app, date).await?;
        }
        Job::Status => {
            jobs::status(app, date).await?;
        }
        Job::Validate => {
            tracked(app, VALIDATION, date, jobs::validate(app, date)).await?;
        }
        Job::Analyze => {
            tracked(app, ANALYSIS_RACE, date, jobs::analyze(app, date, args.symbols.clone(), args.force)).await?;
        }
        Job::Brief => brief(app, args, date).await?,
        Job::MorningCall => {
            tracked(app, MORNING_CALL, date, jobs::morning_call(app, date)).await?;
        }
        Job::PriceUpdate => {
            tracked(app, PRICE_UPDATE, date, jobs::price_update(app, date)).await?;
        }
        Job::All => {
            jobs::plan(app, date).await?;
            // Later stages still run after a failure; the dashboard shows
            // what was blocked.
            let mut failed = Vec::new();
            if let Err(e) = tracked(app, VALIDATION, date, jobs::validate(app, date)).await {
                failed.push(format!("{}: {:#}", VALIDATION, e));
            }
            if let Err(e) = tracked(
                app,
                ANALYSIS_RACE,
                date,
                jobs::analyze(app, date, args.symbols.clone(), args.force),
            )
            .await
            {
                failed.push(format!("{}: {:#}", ANALYSIS_RACE, e));
            }
            if let Err(e) = brief(app, args, date).await {
                failed.push(format!("brief: {:#}", e));
            }
            jobs::status(app, date).await?;
            if !failed.is_empty() {
                anyhow::bail!("{} stage(s) failed: {}", failed.len(), failed.join("; "));
            }
        }
    }
    Ok(())
}

/// Phase 2 runs even when some phase 1 symbols failed; it uses whatever
/// briefs exist.
async fn brief(app: &App, args: &RunArgs, date: &str) -> Result<()> {
    let phase1 = tracked(app, BRIEF_PHASE1, date, jobs::brief_phase1(app, date, args.symbols.clone())).await;
    let phase2 = tracked(app, BRIEF_PHASE2, date, jobs::brief_phase2(app, date)).await;
    phase1?;
    phase2?;
    Ok(())
}
