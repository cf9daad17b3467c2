//! Pending-action queries.

use sqlx::SqliteConnection;

use super::db::{DatabaseError, PanelDatabase};
use super::models::PendingActionRow;

/// Parameters for storing a pending action.
pub struct NewPendingAction<'a> {
    pub user_id: &'a str,
    pub token_hash: &'a str,
    pub action_type: &'a str,
    pub payload: &'a str,
    pub expires_at: i64,
}

/// Stamp `last_email_sent_at = now` unless the previous email is younger than
/// `cooldown_secs`. Returns `false` when the user is still cooling down or
/// does not exist.
///
/// As the first write of a transaction this also takes the write lock, so two
/// concurrent requests for one user cannot both pass.
pub async fn claim_email_slot(
    conn: &mut SqliteConnection,
    user_id: &str,
    now: i64,
    cooldown_secs: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE users SET last_email_sent_at = ?
         WHERE id = ? AND (last_email_sent_at IS NULL OR last_email_sent_at <= ?)",
    )
    .bind(now)
    .bind(user_id)
    .bind(now - cooldown_secs)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// When the user's last confirmation email went out. `NotFound` if the user
/// does not exist.
pub async fn last_email_sent_at(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<i64>, DatabaseError> {
    let row: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT last_email_sent_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|(ts,)| ts)
        .ok_or_else(|| DatabaseError::NotFound(format!("User {user_id}")))
}

pub async fn insert_pending_action(
    conn: &mut SqliteConnection,
    action: &NewPendingAction<'_>,
    now: i64,
) -> Result<i64, DatabaseError> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO pending_actions (user_id, token_hash, action_type, payload, expires_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(action.user_id)
    .bind(action.token_hash)
    .bind(action.action_type)
    .bind(action.payload)
    .bind(action.expires_at)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Look up, check expiry and delete in a single statement.
///
/// Of any number of concurrent callers at most one receives the row. Expired
/// rows are not returned and are left for the sweeper.
pub async fn take_pending_action(
    conn: &mut SqliteConnection,
    token_hash: &str,
    now: i64,
) -> Result<Option<PendingActionRow>, DatabaseError> {
    let row = sqlx::query_as::<_, PendingActionRow>(
        "DELETE FROM pending_actions WHERE token_hash = ? AND expires_at > ? RETURNING *",
    )
    .bind(token_hash)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

impl PanelDatabase {
    pub async fn consume_pending_action(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<PendingActionRow>, DatabaseError> {
        let mut conn = self.acquire().await?;
        take_pending_action(&mut conn, token_hash, now).await
    }

    /// Remove every action whose expiry has passed.
    pub async fn delete_expired_pending_actions(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM pending_actions WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_pending_actions(&self, user_id: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_actions WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
