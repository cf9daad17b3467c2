//! User and fingerprint queries.
//!
//! Functions taking a `&mut SqliteConnection` run inside a caller's
//! transaction; the `PanelDatabase` methods wrap them for standalone use.

use panelgate_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{Fingerprint, NewUser, User};

/// Insert a user and return the stored row.
pub async fn insert_user(
    conn: &mut SqliteConnection,
    new: &NewUser<'_>,
) -> Result<User, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = unix_timestamp();

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, email, server_username, name, password_hash, role, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(&id)
    .bind(new.email)
    .bind(new.server_username)
    .bind(new.name)
    .bind(new.password_hash)
    .bind(new.role.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(user)
}

pub async fn find_user(conn: &mut SqliteConnection, id: &str) -> Result<User, DatabaseError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
}

pub async fn update_password_hash(
    conn: &mut SqliteConnection,
    user_id: &str,
    password_hash: &str,
) -> Result<(), DatabaseError> {
    let result = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
        .bind(password_hash)
        .bind(unix_timestamp())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound(format!("User {user_id}")));
    }
    Ok(())
}

/// Register a device for a user, or refresh it if already known.
pub async fn upsert_fingerprint(
    conn: &mut SqliteConnection,
    user_id: &str,
    fingerprint: &str,
) -> Result<(), DatabaseError> {
    let now = unix_timestamp();
    sqlx::query(
        "INSERT INTO fingerprints (user_id, fingerprint, created_at, last_used_at) VALUES (?, ?, ?, ?)
         ON CONFLICT (user_id, fingerprint) DO UPDATE SET last_used_at = excluded.last_used_at",
    )
    .bind(user_id)
    .bind(fingerprint)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl PanelDatabase {
    // =========================================================================
    // User queries
    // =========================================================================

    pub async fn create_user(&self, new: &NewUser<'_>) -> Result<User, DatabaseError> {
        let mut conn = self.acquire().await?;
        insert_user(&mut conn, new).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: &str) -> Result<User, DatabaseError> {
        let mut conn = self.acquire().await?;
        find_user(&mut conn, id).await
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User with email {email}")))
    }

    pub async fn get_user_by_server_username(
        &self,
        server_username: &str,
    ) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE server_username = ?")
            .bind(server_username)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound(format!("User with server username {server_username}"))
            })
    }

    pub async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY created_at, email")
            .fetch_all(self.pool())
            .await?;
        Ok(users)
    }

    /// Number of active administrators.
    pub async fn count_admins(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE role = 'admin' AND is_active = 1")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Flip the active flag. Returns `false` if the user does not exist.
    pub async fn set_user_active(&self, id: &str, active: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Fingerprint queries
    // =========================================================================

    /// Returns whether the device is known, refreshing `last_used_at` if so.
    pub async fn touch_fingerprint(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE fingerprints SET last_used_at = ? WHERE user_id = ? AND fingerprint = ?",
        )
        .bind(unix_timestamp())
        .bind(user_id)
        .bind(fingerprint)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_fingerprint(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.acquire().await?;
        upsert_fingerprint(&mut conn, user_id, fingerprint).await
    }

    pub async fn list_fingerprints(&self, user_id: &str) -> Result<Vec<Fingerprint>, DatabaseError> {
        let rows = sqlx::query_as::<_, Fingerprint>(
            "SELECT * FROM fingerprints WHERE user_id = ? ORDER BY last_used_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Forget every device of a user, forcing two-factor login again.
    pub async fn delete_fingerprints(&self, user_id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM fingerprints WHERE user_id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
