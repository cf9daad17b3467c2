//! Pending-action engine: step-up confirmation with single-use tokens.

use std::sync::Arc;
use std::time::Duration;

use panelgate_core::config::Config;
use panelgate_core::db::{duration_secs, unix_timestamp};
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use super::action::{ActionPayload, ActionType};
use crate::audit::{AuditSink, NullAudit, attempt};
use crate::auth::JwtManager;
use crate::auth::password::random_token;
use crate::delivery::DeliveryChannel;
use crate::error::{Error, Result};
use crate::storage::queries_pending::{
    claim_email_slot, insert_pending_action, last_email_sent_at, take_pending_action,
};
use crate::storage::{DatabaseError, NewPendingAction, PanelDatabase};

/// Configuration for the pending-action engine.
#[derive(Debug, Clone)]
pub struct PendingConfig {
    /// Lifetime of a confirmation token.
    pub ttl: Duration,
    /// Minimum gap between two confirmation emails to the same user.
    pub email_cooldown: Duration,
    /// Volumes an invitation may place a new home directory on.
    pub home_volumes: Vec<String>,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PendingConfig {
    fn from(c: &Config) -> Self {
        Self {
            ttl: Duration::from_secs(c.confirmation.ttl_secs),
            email_cooldown: Duration::from_secs(c.confirmation.email_cooldown_secs),
            home_volumes: c.accounts.home_volumes.clone(),
        }
    }
}

/// A pending action that has just been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedAction {
    pub user_id: String,
    pub payload: ActionPayload,
}

impl ConsumedAction {
    pub const fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }
}

#[derive(Clone)]
pub struct PendingActionEngine {
    db: PanelDatabase,
    delivery: Arc<dyn DeliveryChannel>,
    config: PendingConfig,
    audit: Arc<dyn AuditSink>,
}

impl PendingActionEngine {
    pub fn new(db: PanelDatabase, delivery: Arc<dyn DeliveryChannel>, config: PendingConfig) -> Self {
        Self {
            db,
            delivery,
            config,
            audit: Arc::new(NullAudit),
        }
    }

    /// Record every confirmation request in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub const fn config(&self) -> &PendingConfig {
        &self.config
    }

    /// Create a pending action with the configured lifetime.
    pub async fn create(&self, user_id: &str, action: ActionType, payload: &Value) -> Result<String> {
        self.create_with_ttl(user_id, action, payload, self.config.ttl)
            .await
    }

    /// Like [`create`](Self::create) with the action given by its wire name.
    /// Unknown names are a validation error.
    pub async fn create_named(&self, user_id: &str, action: &str, payload: &Value) -> Result<String> {
        match action.parse::<ActionType>() {
            Ok(action) => self.create(user_id, action, payload).await,
            Err(e) => {
                let result = Err(e);
                self.audit
                    .append(attempt(Some(user_id), "confirmations", action, &result));
                result
            }
        }
    }

    /// Validate `payload`, persist the action and deliver its confirmation
    /// token out-of-band. The raw token is returned and never stored.
    pub async fn create_with_ttl(
        &self,
        user_id: &str,
        action: ActionType,
        payload: &Value,
        ttl: Duration,
    ) -> Result<String> {
        let result = self.request(user_id, action, payload, ttl).await;
        self.audit
            .append(attempt(Some(user_id), "confirmations", action.as_str(), &result));
        result
    }

    #[instrument(skip(self, payload), fields(action = %action))]
    async fn request(
        &self,
        user_id: &str,
        action: ActionType,
        payload: &Value,
        ttl: Duration,
    ) -> Result<String> {
        let user = self.db.get_user(user_id).await?;
        if !user.is_active {
            return Err(Error::Forbidden("account is deactivated".into()));
        }
        if action.requires_admin() && !user.role().is_admin() {
            return Err(Error::Forbidden(format!("{action} requires an administrator")));
        }

        let payload = ActionPayload::parse(action, payload, &user.server_username)?;
        if let ActionPayload::InviteUser(invite) = &payload
            && !self.config.home_volumes.contains(&invite.home_volume)
        {
            return Err(Error::Validation(format!(
                "home volume must be one of: {}",
                self.config.home_volumes.join(", ")
            )));
        }
        // Checked before the email slot is claimed; the insert on confirmation
        // still enforces uniqueness.
        if let Some((email, server_username)) = payload.invitee() {
            self.ensure_unregistered(email, server_username).await?;
        }
        let payload_json = payload.to_json().to_string();

        let token = random_token();
        let token_hash = JwtManager::hash_token(&token);
        let now = unix_timestamp();
        let cooldown = duration_secs(self.config.email_cooldown);

        let mut tx = self.db.begin().await?;
        if !claim_email_slot(&mut tx, user_id, now, cooldown).await? {
            let last = last_email_sent_at(&mut tx, user_id).await?.unwrap_or(now);
            tx.rollback().await?;
            let retry_after_secs = (last + cooldown - now).max(1);
            warn!(user_id, retry_after_secs, "Confirmation email rate limited");
            return Err(Error::RateLimited { retry_after_secs });
        }
        insert_pending_action(
            &mut tx,
            &NewPendingAction {
                user_id,
                token_hash: &token_hash,
                action_type: action.as_str(),
                payload: &payload_json,
                expires_at: now + duration_secs(ttl),
            },
            now,
        )
        .await?;
        tx.commit().await?;

        if let Err(e) = self.delivery.send(&user, &token, action).await {
            warn!(user_id, error = %e, "Confirmation delivery failed");
        }

        info!(user_id, ttl_secs = ttl.as_secs(), "Pending action created");
        Ok(token)
    }

    /// Consume a confirmation token. Succeeds at most once per token; used,
    /// expired and unknown tokens all yield `NotFoundOrExpired`.
    #[instrument(skip_all)]
    pub async fn consume(&self, token: &str) -> Result<ConsumedAction> {
        let mut tx = self.db.begin().await?;
        let consumed = self.consume_in(&mut tx, token).await?;
        tx.commit().await?;
        Ok(consumed)
    }

    /// Like [`consume`](Self::consume), inside the caller's transaction so
    /// the consumption rolls back with it.
    pub async fn consume_in(&self, conn: &mut SqliteConnection, token: &str) -> Result<ConsumedAction> {
        let token_hash = JwtManager::hash_token(token);
        let row = take_pending_action(conn, &token_hash, unix_timestamp())
            .await?
            .ok_or(Error::NotFoundOrExpired)?;

        let action: ActionType = row
            .action_type
            .parse()
            .map_err(|_| Error::Internal(format!("stored action type {}", row.action_type)))?;
        let payload = ActionPayload::from_stored(action, &row.payload)?;

        info!(user_id = %row.user_id, action = %action, "Pending action consumed");
        Ok(ConsumedAction {
            user_id: row.user_id,
            payload,
        })
    }

    async fn ensure_unregistered(&self, email: &str, server_username: &str) -> Result<()> {
        let lookups = [
            self.db.get_user_by_email(email).await,
            self.db.get_user_by_server_username(server_username).await,
        ];
        for lookup in lookups {
            match lookup {
                Ok(_) => {
                    return Err(Error::Conflict(
                        "email or server username is already registered".into(),
                    ));
                }
                Err(DatabaseError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete expired actions. Hygiene only: expired tokens are already
    /// unusable.
    pub async fn expire_sweep(&self) -> Result<u64> {
        let removed = self
            .db
            .delete_expired_pending_actions(unix_timestamp())
            .await?;
        if removed > 0 {
            info!(removed, "Expired pending actions swept");
        }
        Ok(removed)
    }
}
