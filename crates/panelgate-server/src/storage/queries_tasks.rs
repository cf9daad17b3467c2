//! Async task queries.
//!
//! Every status update is conditional on the current status, so a
//! transition that lost a race affects no rows instead of going backwards.
//!
//! `updated_at` is written as `MAX(updated_at + 1, now)`: timestamps are in
//! seconds and a fast task would otherwise show no change across its
//! transitions.
//!
//! Terminal updates strip passwords from the stored payload. Workers get the
//! payload in memory when the task is dispatched, and a `pending` row keeps
//! it so the task can be resumed after a restart.

use panelgate_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, PanelDatabase};
use super::models::AsyncTaskRow;

/// Persist a new `pending` task.
pub async fn insert_task(
    conn: &mut SqliteConnection,
    id: &str,
    user_id: &str,
    task_type: &str,
    payload: &str,
) -> Result<(), DatabaseError> {
    let now = unix_timestamp();
    sqlx::query(
        "INSERT INTO async_tasks (id, user_id, task_type, status, payload, created_at, updated_at)
         VALUES (?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(task_type)
    .bind(payload)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl PanelDatabase {
    pub async fn create_task(
        &self,
        id: &str,
        user_id: &str,
        task_type: &str,
        payload: &str,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.acquire().await?;
        insert_task(&mut conn, id, user_id, task_type, payload).await
    }

    pub async fn get_task(&self, id: &str) -> Result<AsyncTaskRow, DatabaseError> {
        sqlx::query_as::<_, AsyncTaskRow>("SELECT * FROM async_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// Tasks owned by a user, newest first.
    pub async fn list_user_tasks(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AsyncTaskRow>, DatabaseError> {
        let tasks = sqlx::query_as::<_, AsyncTaskRow>(
            "SELECT * FROM async_tasks WHERE user_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(tasks)
    }

    /// `pending -> running`. Returns `false` if the task was not pending.
    pub async fn mark_task_running(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE async_tasks SET status = 'running', updated_at = MAX(updated_at + 1, ?)
             WHERE id = ? AND status = 'pending'",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `running -> completed` with its result.
    pub async fn complete_task(&self, id: &str, result_json: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE async_tasks SET status = 'completed', result = ?,
                 payload = json_remove(payload, '$.new_password', '$.initial_password'),
                 updated_at = MAX(updated_at + 1, ?)
             WHERE id = ? AND status = 'running'",
        )
        .bind(result_json)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `pending | running -> failed` with its error message.
    pub async fn fail_task(&self, id: &str, error_message: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE async_tasks SET status = 'failed', error_message = ?,
                 payload = json_remove(payload, '$.new_password', '$.initial_password'),
                 updated_at = MAX(updated_at + 1, ?)
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(error_message)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail every task left `running` by a previous process.
    pub async fn fail_orphaned_tasks(&self, error_message: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE async_tasks SET status = 'failed', error_message = ?,
                 payload = json_remove(payload, '$.new_password', '$.initial_password'),
                 updated_at = MAX(updated_at + 1, ?)
             WHERE status = 'running'",
        )
        .bind(error_message)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Tasks that were persisted but never started, oldest first.
    pub async fn list_pending_tasks(&self) -> Result<Vec<AsyncTaskRow>, DatabaseError> {
        let tasks = sqlx::query_as::<_, AsyncTaskRow>(
            "SELECT * FROM async_tasks WHERE status = 'pending' ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(tasks)
    }
}
