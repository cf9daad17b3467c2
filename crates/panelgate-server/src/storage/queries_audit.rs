//! Operation log queries. The table is append-only; triggers reject
//! updates and deletes.

use panelgate_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{NewOperationLog, OperationLog};

/// One page of audit rows plus the total matching count.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub entries: Vec<OperationLog>,
    pub total: i64,
}

impl PanelDatabase {
    pub async fn insert_operation_log(&self, entry: &NewOperationLog) -> Result<i64, DatabaseError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO operation_logs (user_id, username, endpoint, method, params, result_code, result_message, ip_address, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&entry.user_id)
        .bind(&entry.username)
        .bind(&entry.endpoint)
        .bind(&entry.method)
        .bind(&entry.params)
        .bind(entry.result_code)
        .bind(&entry.result_message)
        .bind(&entry.ip_address)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Newest-first page of the log, optionally restricted to one user.
    pub async fn list_operation_logs(
        &self,
        user_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<LogPage, DatabaseError> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM operation_logs WHERE (? IS NULL OR user_id = ?)")
                .bind(user_id)
                .bind(user_id)
                .fetch_one(self.pool())
                .await?;

        let entries = sqlx::query_as::<_, OperationLog>(
            "SELECT * FROM operation_logs WHERE (? IS NULL OR user_id = ?)
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(LogPage { entries, total })
    }
}
