use chrono::NaiveTime;
use pipeline_core::PipelineResult;
use serde::Serialize;
use serde_json::json;
use sql_store::{Store, TaskLogRow};

use crate::logger::TaskStatus;

pub const STOCK_META_SYNC: &str = "stock_meta_sync";
pub const PRICE_SYNC_CN: &str = "price_sync_cn";
pub const PRICE_SYNC_HK: &str = "price_sync_hk";
pub const MORNING_CALL: &str = "morning_call";
pub const VALIDATION: &str = "validation";
pub const ANALYSIS_RACE: &str = "analysis_race";
pub const BRIEF_PHASE1: &str = "brief_phase1";
pub const BRIEF_PHASE2: &str = "brief_phase2";

/// Agent owning the ingestion jobs; the analysis jobs belong to the runner.
pub const DATA_AGENT: &str = "data-sync";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedTask {
    pub name: String,
    pub display: String,
    pub task_type: String,
    pub agent_id: String,
    /// Market-local wall clock.
    pub expected_start: NaiveTime,
    pub depends_on: Vec<String>,
}

impl PlannedTask {
    fn new(name: &str, display: &str, task_type: &str, agent_id: &str, hour: u32, minute: u32, deps: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display: display.to_string(),
            task_type: task_type.to_string(),
            agent_id: agent_id.to_string(),
            expected_start: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Ordered list of every job expected on a trading day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPlan {
    tasks: Vec<PlannedTask>,
}

impl DailyPlan {
    pub fn new(tasks: Vec<PlannedTask>) -> Self {
        Self { tasks }
    }

    /// The standard day, with analysis jobs owned by `runner_agent`.
    pub fn standard(runner_agent: &str) -> Self {
        Self::new(vec![
            PlannedTask::new(MORNING_CALL, "早盘提醒", "notification", runner_agent, 8, 30, &[]),
            PlannedTask::new(STOCK_META_SYNC, "股票元数据同步", "sync", DATA_AGENT, 9, 0, &[]),
            PlannedTask::new(PRICE_SYNC_CN, "A股行情同步", "sync", DATA_AGENT, 15, 30, &[STOCK_META_SYNC]),
            PlannedTask::new(PRICE_SYNC_HK, "港股行情同步", "sync", DATA_AGENT, 16, 30, &[STOCK_META_SYNC]),
            PlannedTask::new(VALIDATION, "预测验证", "validation", runner_agent, 17, 0, &[PRICE_SYNC_CN, PRICE_SYNC_HK]),
            PlannedTask::new(ANALYSIS_RACE, "AI 模型赛马", "analysis", runner_agent, 17, 30, &[VALIDATION]),
            PlannedTask::new(BRIEF_PHASE1, "个股简报生成", "brief", runner_agent, 19, 0, &[ANALYSIS_RACE]),
            PlannedTask::new(BRIEF_PHASE2, "用户简报组装推送", "brief", runner_agent, 20, 0, &[BRIEF_PHASE1]),
        ])
    }

    pub fn tasks(&self) -> &[PlannedTask] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Insert a pending row for every planned task that has none on `date`.
    /// Returns how many rows were written.
    pub async fn seed(&self, store: &Store, date: &str) -> PipelineResult<usize> {
        let mut seeded = 0;
        for task in &self.tasks {
            if store.latest_task_log(&task.name, date, &task.agent_id).await?.is_some() {
                continue;
            }
            store
                .insert_task_log(&TaskLogRow {
                    agent_id: task.agent_id.clone(),
                    task_name: task.name.clone(),
                    display_name: Some(task.display.clone()),
                    task_type: Some(task.task_type.clone()),
                    date: date.to_string(),
                    status: TaskStatus::Pending.as_str().to_string(),
                    triggered_by: Some("plan".into()),
                    metadata: Some(
                        json!({
                            "expected_start": task.expected_start.format("%H:%M").to_string(),
                            "depends_on": task.depends_on,
                        })
                        .to_string(),
                    ),
                    ..Default::default()
                })
                .await?;
            seeded += 1;
        }
        tracing::info!(date, seeded, "daily plan seeded");
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_point_backwards() {
        let plan = DailyPlan::standard("runner");
        for (i, task) in plan.tasks().iter().enumerate() {
            for dep in &task.depends_on {
                let pos = plan.tasks().iter().position(|t| &t.name == dep).unwrap();
                assert!(pos < i, "{} depends on later task {}", task.name, dep);
            }
        }
        assert_eq!(plan.get(BRIEF_PHASE2).unwrap().depends_on, vec![BRIEF_PHASE1]);
        assert_eq!(plan.get(PRICE_SYNC_HK).unwrap().agent_id, DATA_AGENT);
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let plan = DailyPlan::standard("runner");
        assert_eq!(plan.seed(&store, "2026-01-09").await.unwrap(), plan.tasks().len());
        assert_eq!(plan.seed(&store, "2026-01-09").await.unwrap(), 0);

        let row = store.latest_task_log(VALIDATION, "2026-01-09", "runner").await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.metadata.unwrap().contains("\"expected_start\":\"17:00\""));
    }
}
