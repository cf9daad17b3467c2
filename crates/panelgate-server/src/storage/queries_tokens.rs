//! Active-token queries. A row exists iff its credential is not revoked.

use panelgate_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, PanelDatabase};
use super::models::ActiveToken;

/// Parameters for recording an issued credential.
pub struct NewActiveToken<'a> {
    pub user_id: &'a str,
    pub token_id: &'a str,
    pub fingerprint: Option<&'a str>,
    pub ip_address: Option<&'a str>,
}

/// Record a token, first evicting the user's oldest tokens so that at most
/// `max_sessions` remain afterwards. Returns the number evicted.
///
/// Run inside a transaction so eviction and insert commit together.
pub async fn insert_active_token(
    conn: &mut SqliteConnection,
    token: &NewActiveToken<'_>,
    max_sessions: u32,
) -> Result<u64, DatabaseError> {
    let keep = i64::from(max_sessions.saturating_sub(1));

    let evicted = sqlx::query(
        "DELETE FROM active_tokens WHERE id IN (
             SELECT id FROM active_tokens WHERE user_id = ?
             ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?
         )",
    )
    .bind(token.user_id)
    .bind(keep)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(
        "INSERT INTO active_tokens (user_id, token_id, fingerprint, ip_address, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(token.user_id)
    .bind(token.token_id)
    .bind(token.fingerprint)
    .bind(token.ip_address)
    .bind(unix_timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(evicted)
}

/// Delete every token of a user in one statement.
pub async fn delete_user_tokens(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<u64, DatabaseError> {
    let result = sqlx::query("DELETE FROM active_tokens WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

impl PanelDatabase {
    pub async fn is_token_active(&self, token_id: &str) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM active_tokens WHERE token_id = ?")
            .bind(token_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Delete a single token. Returns `false` if it was already gone.
    pub async fn delete_token(&self, token_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM active_tokens WHERE token_id = ?")
            .bind(token_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke_user_tokens(&self, user_id: &str) -> Result<u64, DatabaseError> {
        let mut conn = self.acquire().await?;
        delete_user_tokens(&mut conn, user_id).await
    }

    /// Active tokens of a user, newest first.
    pub async fn list_user_tokens(&self, user_id: &str) -> Result<Vec<ActiveToken>, DatabaseError> {
        let tokens = sqlx::query_as::<_, ActiveToken>(
            "SELECT * FROM active_tokens WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(tokens)
    }
}
