//! Active-token registry.
//!
//! A signed credential is only honoured while its token ID is registered
//! here, so deleting the row revokes it regardless of the signed expiry.

use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::queries_tokens::{NewActiveToken, delete_user_tokens, insert_active_token};
use crate::storage::{ActiveToken, PanelDatabase};

#[derive(Clone)]
pub struct TokenRegistry {
    db: PanelDatabase,
    max_sessions: u32,
}

impl TokenRegistry {
    pub fn new(db: PanelDatabase, max_sessions: u32) -> Self {
        Self {
            db,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Register a new token ID for `user_id`, evicting the user's oldest
    /// tokens beyond the session limit.
    pub async fn issue(
        &self,
        user_id: &str,
        fingerprint: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<String> {
        let mut tx = self.db.begin().await?;
        let token_id = self
            .issue_in(&mut tx, user_id, fingerprint, ip_address)
            .await?;
        tx.commit().await?;
        Ok(token_id)
    }

    /// Like [`issue`](Self::issue), inside the caller's transaction.
    pub async fn issue_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        fingerprint: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<String> {
        let token_id = uuid::Uuid::new_v4().to_string();
        let evicted = insert_active_token(
            conn,
            &NewActiveToken {
                user_id,
                token_id: &token_id,
                fingerprint,
                ip_address,
            },
            self.max_sessions,
        )
        .await?;

        if evicted > 0 {
            info!(user_id, evicted, "Session limit reached, oldest tokens evicted");
        }
        debug!(user_id, token_id = %token_id, "Token issued");
        Ok(token_id)
    }

    /// Absence means revoked.
    pub async fn is_active(&self, token_id: &str) -> Result<bool> {
        Ok(self.db.is_token_active(token_id).await?)
    }

    /// Revoke one token. Returns `false` if it was not active.
    pub async fn revoke(&self, token_id: &str) -> Result<bool> {
        let revoked = self.db.delete_token(token_id).await?;
        if revoked {
            info!(token_id, "Token revoked");
        }
        Ok(revoked)
    }

    /// Revoke every token of a user in a single statement.
    pub async fn revoke_all(&self, user_id: &str) -> Result<u64> {
        let count = self.db.revoke_user_tokens(user_id).await?;
        info!(user_id, count, "All user tokens revoked");
        Ok(count)
    }

    pub async fn revoke_all_in(&self, conn: &mut SqliteConnection, user_id: &str) -> Result<u64> {
        Ok(delete_user_tokens(conn, user_id).await?)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ActiveToken>> {
        Ok(self.db.list_user_tokens(user_id).await?)
    }

    pub const fn max_sessions(&self) -> u32 {
        self.max_sessions
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::{NewUser, Role};

    async fn setup(max_sessions: u32) -> (TokenRegistry, String) {
        let db = PanelDatabase::open_in_memory().await.unwrap();
        let user = db
            .create_user(&NewUser {
                email: "alice@example.com",
                server_username: "alice",
                name: "Alice",
                password_hash: "hash",
                role: Role::User,
            })
            .await
            .unwrap();
        (TokenRegistry::new(db, max_sessions), user.id)
    }

    #[tokio::test]
    async fn issued_token_is_active_until_revoked() {
        let (registry, user) = setup(5).await;
        let token = registry
            .issue(&user, Some("laptop"), Some("10.0.0.1"))
            .await
            .unwrap();

        assert!(registry.is_active(&token).await.unwrap());
        assert!(registry.revoke(&token).await.unwrap());
        assert!(!registry.is_active(&token).await.unwrap());
        assert!(!registry.revoke(&token).await.unwrap());
        assert!(!registry.is_active(&token).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_all_clears_every_session() {
        let (registry, user) = setup(5).await;
        let a = registry.issue(&user, None, None).await.unwrap();
        let b = registry.issue(&user, None, None).await.unwrap();

        assert_eq!(registry.revoke_all(&user).await.unwrap(), 2);
        assert!(!registry.is_active(&a).await.unwrap());
        assert!(!registry.is_active(&b).await.unwrap());
        assert!(registry.list(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_limit_keeps_newest() {
        let (registry, user) = setup(2).await;
        let first = registry.issue(&user, None, None).await.unwrap();
        let second = registry.issue(&user, None, None).await.unwrap();
        let third = registry.issue(&user, None, None).await.unwrap();

        assert!(!registry.is_active(&first).await.unwrap());
        assert!(registry.is_active(&second).await.unwrap());
        assert!(registry.is_active(&third).await.unwrap());
    }

    #[tokio::test]
    async fn zero_session_limit_is_clamped() {
        let (registry, _) = setup(0).await;
        assert_eq!(registry.max_sessions(), 1);
    }
}
