use std::collections::HashMap;

use chrono::{NaiveDateTime, NaiveTime};
use pipeline_core::calendar::parse_date;
use pipeline_core::{PipelineError, PipelineResult};
use serde::Serialize;
use sql_store::{Store, TaskLogRow};

use crate::logger::TaskStatus;
use crate::plan::{DailyPlan, PlannedTask};

/// Minutes a job may start after its expected time and still count as on time.
pub const GRACE_MINUTES: i64 = 15;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    OnTime,
    Late,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub task: PlannedTask,
    pub state: JobState,
    pub status: TaskStatus,
    /// Start delay in minutes, or how overdue a job that never started is.
    pub latency_minutes: Option<i64>,
    /// Dependencies that have not succeeded yet.
    pub blocked_by: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub date: String,
    pub jobs: Vec<JobStatus>,
    /// `(task_name, minutes)` of the worst positive latency.
    pub longest_latency: Option<(String, i64)>,
}

impl DashboardView {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

fn at(date: chrono::NaiveDate, time: NaiveTime) -> NaiveDateTime {
    date.and_time(time)
}

/// Classify every planned job against the current rows of `date`.
pub fn evaluate(plan: &DailyPlan, rows: &[TaskLogRow], date: &str, now: NaiveDateTime) -> PipelineResult<DashboardView> {
    let day = parse_date(date)?;
    let current: HashMap<(&str, &str), &TaskLogRow> = rows
        .iter()
        .map(|r| ((r.task_name.as_str(), r.agent_id.as_str()), r))
        .collect();
    let status_of = |task: &PlannedTask| {
        current
            .get(&(task.name.as_str(), task.agent_id.as_str()))
            .map(|r| TaskStatus::parse(&r.status))
            .unwrap_or(TaskStatus::Pending)
    };

    let mut jobs = Vec::with_capacity(plan.tasks().len());
    for task in plan.tasks() {
        let row = current.get(&(task.name.as_str(), task.agent_id.as_str())).copied();
        let status = status_of(task);
        let expected = at(day, task.expected_start);
        let started = row
            .and_then(|r| r.start_time.as_deref())
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok());

        let latency_minutes = match (status, started) {
            (TaskStatus::Running | TaskStatus::Success | TaskStatus::Failed, Some(start)) => {
                Some((start - expected).num_minutes())
            }
            (TaskStatus::Pending, _) if now > expected => Some((now - expected).num_minutes()),
            _ => None,
        };
        let state = match status {
            TaskStatus::Failed => JobState::Failed,
            TaskStatus::Pending if latency_minutes.is_some_and(|m| m > GRACE_MINUTES) => JobState::Late,
            TaskStatus::Pending => JobState::Pending,
            _ if latency_minutes.is_some_and(|m| m > GRACE_MINUTES) => JobState::Late,
            _ => JobState::OnTime,
        };
        let blocked_by = task
            .depends_on
            .iter()
            .filter(|dep| {
                plan.get(dep)
                    .map(|d| status_of(d) != TaskStatus::Success)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        jobs.push(JobStatus {
            task: task.clone(),
            state,
            status,
            latency_minutes,
            blocked_by,
            message: row.and_then(|r| r.message.clone()),
        });
    }

    let longest_latency = jobs
        .iter()
        .filter_map(|j| j.latency_minutes.filter(|m| *m > 0).map(|m| (j.task.name.clone(), m)))
        .max_by_key(|(_, m)| *m);

    Ok(DashboardView {
        date: date.to_string(),
        jobs,
        longest_latency,
    })
}

/// Dashboard for `date` as of the store clock.
pub async fn dashboard(store: &Store, plan: &DailyPlan, date: &str) -> PipelineResult<DashboardView> {
    let rows = store.task_logs_on(date).await?;
    let now = NaiveDateTime::parse_from_str(&store.now(), TIMESTAMP_FORMAT)
        .map_err(|e| PipelineError::Parse(format!("store clock: {}", e)))?;
    evaluate(plan, &rows, date, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ANALYSIS_RACE, BRIEF_PHASE1, MORNING_CALL, VALIDATION};

    fn row(task: &str, status: &str, start: Option<&str>) -> TaskLogRow {
        TaskLogRow {
            agent_id: "runner".into(),
            task_name: task.into(),
            date: "2026-01-09".into(),
            status: status.into(),
            start_time: start.map(|s| format!("2026-01-09 {}", s)),
            ..Default::default()
        }
    }

    fn now(time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("2026-01-09 {}", time), TIMESTAMP_FORMAT).unwrap()
    }

    fn job<'a>(view: &'a DashboardView, name: &str) -> &'a JobStatus {
        view.jobs.iter().find(|j| j.task.name == name).unwrap()
    }

    #[test]
    fn classifies_jobs() {
        let plan = DailyPlan::standard("runner");
        let rows = vec![
            row(MORNING_CALL, "success", Some("08:31:00")),
            row(VALIDATION, "success", Some("17:40:00")),
            row(ANALYSIS_RACE, "failed", Some("17:45:00")),
        ];
        let view = evaluate(&plan, &rows, "2026-01-09", now("19:10:00")).unwrap();

        assert_eq!(job(&view, MORNING_CALL).state, JobState::OnTime);
        assert_eq!(job(&view, VALIDATION).state, JobState::Late);
        assert_eq!(job(&view, VALIDATION).latency_minutes, Some(40));
        assert_eq!(job(&view, ANALYSIS_RACE).state, JobState::Failed);
        // expected 19:00, now 19:10: inside the grace window
        assert_eq!(job(&view, BRIEF_PHASE1).state, JobState::Pending);
        assert_eq!(job(&view, BRIEF_PHASE1).blocked_by, vec![ANALYSIS_RACE]);
        // ingestion jobs have no rows and are hours overdue
        assert_eq!(view.longest_latency.as_ref().unwrap().0, "stock_meta_sync");
        assert_eq!(view.count(JobState::Failed), 1);
    }

    #[test]
    fn nothing_due_yet() {
        let plan = DailyPlan::standard("runner");
        let view = evaluate(&plan, &[], "2026-01-09", now("07:00:00")).unwrap();
        assert_eq!(view.count(JobState::Pending), plan.tasks().len());
        assert!(view.longest_latency.is_none());
        assert!(evaluate(&plan, &[], "not-a-date", now("07:00:00")).is_err());
    }
}
