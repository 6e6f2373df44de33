use std::fmt::Display;
use std::future::Future;

use pipeline_core::PipelineResult;
use serde::Serialize;
use serde_json::Value;
use sql_store::{Store, TaskLogRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => TaskStatus::Running,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Writes the `task_logs` row of one job run, keyed by
/// (task_name, date, agent_id).
pub struct TaskLogger {
    store: Store,
    agent_id: String,
    task_name: String,
    date: String,
    triggered_by: Option<String>,
    active: Option<TaskLogRow>,
}

impl TaskLogger {
    pub fn new(
        store: Store,
        agent_id: impl Into<String>,
        task_name: impl Into<String>,
        date: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
            task_name: task_name.into(),
            date: date.into(),
            triggered_by: None,
            active: None,
        }
    }

    pub fn triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = Some(source.into());
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Reuses the latest row while it is pending or running; a finished run
    /// gets a fresh row.
    pub async fn start(
        &mut self,
        display: &str,
        task_type: &str,
        dimensions: Option<Value>,
        message: &str,
    ) -> PipelineResult<i64> {
        let latest = self
            .store
            .latest_task_log(&self.task_name, &self.date, &self.agent_id)
            .await?;

        let mut row = match latest {
            Some(row) if TaskStatus::parse(&row.status).is_open() => row,
            _ => TaskLogRow {
                agent_id: self.agent_id.clone(),
                task_name: self.task_name.clone(),
                date: self.date.clone(),
                ..Default::default()
            },
        };
        row.display_name = Some(display.to_string());
        row.task_type = Some(task_type.to_string());
        row.status = TaskStatus::Running.as_str().to_string();
        row.start_time = Some(self.store.now());
        row.end_time = None;
        row.message = Some(message.to_string());
        if let Some(dims) = dimensions {
            row.dimensions = Some(dims.to_string());
        }
        if self.triggered_by.is_some() {
            row.triggered_by = self.triggered_by.clone();
        }

        let id = match row.id {
            Some(id) => {
                self.store.update_task_log(&row).await?;
                id
            }
            None => {
                let id = self.store.insert_task_log(&row).await?;
                row.id = Some(id);
                id
            }
        };
        tracing::info!(task = %self.task_name, date = %self.date, id, "task started");
        self.active = Some(row);
        Ok(id)
    }

    pub async fn success(&mut self, message: &str, meta: Option<Value>) -> PipelineResult<()> {
        self.finish(TaskStatus::Success, message, meta).await
    }

    pub async fn fail(&mut self, message: &str, meta: Option<Value>) -> PipelineResult<()> {
        self.finish(TaskStatus::Failed, message, meta).await
    }

    async fn finish(&mut self, status: TaskStatus, message: &str, meta: Option<Value>) -> PipelineResult<()> {
        let mut row = match self.active.take() {
            Some(row) => row,
            None => self
                .store
                .latest_task_log(&self.task_name, &self.date, &self.agent_id)
                .await?
                .filter(|row| TaskStatus::parse(&row.status).is_open())
                .unwrap_or_else(|| TaskLogRow {
                    agent_id: self.agent_id.clone(),
                    task_name: self.task_name.clone(),
                    date: self.date.clone(),
                    triggered_by: self.triggered_by.clone(),
                    ..Default::default()
                }),
        };
        row.status = status.as_str().to_string();
        row.end_time = Some(self.store.now());
        row.message = Some(message.to_string());
        if let Some(meta) = meta {
            row.metadata = Some(meta.to_string());
        }

        match row.id {
            Some(_) => self.store.update_task_log(&row).await?,
            None => {
                row.id = Some(self.store.insert_task_log(&row).await?);
            }
        }
        match status {
            TaskStatus::Failed => tracing::warn!(task = %self.task_name, date = %self.date, "task failed: {}", message),
            _ => tracing::info!(task = %self.task_name, date = %self.date, "task {}: {}", status.as_str(), message),
        }
        self.active = Some(row);
        Ok(())
    }

    /// Run `job` between `start` and `success`/`fail`. Bookkeeping errors
    /// are logged and never change the job's result.
    pub async fn track<T, E, F>(mut self, display: &str, task_type: &str, job: F) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        if let Err(e) = self.start(display, task_type, None, "started").await {
            tracing::warn!(task = %self.task_name, "task log start failed: {}", e);
        }
        let result = job.await;
        let logged = match &result {
            Ok(value) => self.success("completed", serde_json::to_value(value).ok()).await,
            Err(e) => self.fail(&e.to_string(), None).await,
        };
        if let Err(e) = logged {
            tracing::warn!(task = %self.task_name, "task log finish failed: {}", e);
        }
        result
    }
}
