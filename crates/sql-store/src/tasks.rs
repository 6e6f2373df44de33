use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};
use crate::params;
use crate::value::Row;

/// One row of `task_logs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRow {
    pub id: Option<i64>,
    pub agent_id: String,
    pub task_name: String,
    pub display_name: Option<String>,
    pub task_type: Option<String>,
    pub date: String,
    pub status: String,
    pub triggered_by: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub dimensions: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<String>,
}

fn task_from_row(row: &Row) -> StoreResult<TaskLogRow> {
    Ok(TaskLogRow {
        id: row.opt_integer("id"),
        agent_id: row.text("agent_id")?,
        task_name: row.text("task_name")?,
        display_name: row.opt_text("display_name"),
        task_type: row.opt_text("task_type"),
        date: row.text("date")?,
        status: row.text("status")?,
        triggered_by: row.opt_text("triggered_by"),
        start_time: row.opt_text("start_time"),
        end_time: row.opt_text("end_time"),
        dimensions: row.opt_text("dimensions"),
        message: row.opt_text("message"),
        metadata: row.opt_text("metadata"),
    })
}

impl Store {
    /// Latest row for (task_name, date, agent_id); it carries the current status.
    pub async fn latest_task_log(
        &self,
        task_name: &str,
        date: &str,
        agent_id: &str,
    ) -> StoreResult<Option<TaskLogRow>> {
        match self
            .query_row(
                "SELECT * FROM task_logs WHERE task_name = ? AND date = ? AND agent_id = ?
                 ORDER BY id DESC LIMIT 1",
                &params![task_name, date, agent_id],
            )
            .await?
        {
            Some(row) => Ok(Some(task_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_task_log(&self, task: &TaskLogRow) -> StoreResult<i64> {
        let row = self
            .query_row(
                "INSERT INTO task_logs (
                    agent_id, task_name, display_name, task_type, date, status,
                    triggered_by, start_time, end_time, dimensions, message, metadata
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 RETURNING id",
                &params![
                    &task.agent_id,
                    &task.task_name,
                    task.display_name.as_deref(),
                    task.task_type.as_deref(),
                    &task.date,
                    &task.status,
                    task.triggered_by.as_deref(),
                    task.start_time.as_deref(),
                    task.end_time.as_deref(),
                    task.dimensions.as_deref(),
                    task.message.as_deref(),
                    task.metadata.as_deref(),
                ],
            )
            .await?;
        row.and_then(|r| r.opt_integer("id"))
            .ok_or_else(|| StoreError::Fatal("task_logs insert returned no id".to_string()))
    }

    /// Rewrite the mutable columns of an existing row.
    pub async fn update_task_log(&self, task: &TaskLogRow) -> StoreResult<()> {
        let id = task
            .id
            .ok_or_else(|| StoreError::Fatal("update_task_log needs a row id".to_string()))?;
        self.execute(
            "UPDATE task_logs SET
                display_name = ?, task_type = ?, status = ?, triggered_by = ?,
                start_time = ?, end_time = ?, dimensions = ?, message = ?, metadata = ?
             WHERE id = ?",
            &params![
                task.display_name.as_deref(),
                task.task_type.as_deref(),
                &task.status,
                task.triggered_by.as_deref(),
                task.start_time.as_deref(),
                task.end_time.as_deref(),
                task.dimensions.as_deref(),
                task.message.as_deref(),
                task.metadata.as_deref(),
                id,
            ],
        )
        .await?;
        Ok(())
    }

    /// Current (latest) row for every task on `date`.
    pub async fn task_logs_on(&self, date: &str) -> StoreResult<Vec<TaskLogRow>> {
        self.query(
            "SELECT t.* FROM task_logs t
             JOIN (
                SELECT task_name, agent_id, MAX(id) AS max_id FROM task_logs
                WHERE date = ? GROUP BY task_name, agent_id
             ) latest ON latest.max_id = t.id
             ORDER BY t.id",
            &params![date],
        )
        .await?
        .iter()
        .map(task_from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_row_wins() {
        let store = Store::in_memory().await.unwrap();
        let mut row = TaskLogRow {
            agent_id: "runner".into(),
            task_name: "analysis_race".into(),
            date: "2026-01-02".into(),
            status: "failed".into(),
            ..Default::default()
        };
        let first = store.insert_task_log(&row).await.unwrap();
        row.status = "running".into();
        let second = store.insert_task_log(&row).await.unwrap();
        assert!(second > first);

        let latest = store
            .latest_task_log("analysis_race", "2026-01-02", "runner")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, Some(second));
        assert_eq!(latest.status, "running");

        let mut done = latest.clone();
        done.status = "success".into();
        store.update_task_log(&done).await.unwrap();
        let on_date = store.task_logs_on("2026-01-02").await.unwrap();
        assert_eq!(on_date.len(), 1);
        assert_eq!(on_date[0].status, "success");
    }
}
