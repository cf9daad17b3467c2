//! Out-of-band delivery of confirmation tokens.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pending::ActionType;
use crate::storage::User;

#[derive(Debug, thiserror::Error)]
#[error("Delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Sends a confirmation token to the user it belongs to (email in
/// production). Failures are logged by the caller and never undo the
/// pending action.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(
        &self,
        user: &User,
        confirmation_token: &str,
        action: ActionType,
    ) -> Result<(), DeliveryError>;
}

/// Writes confirmations to the log. Only suitable for development.
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    async fn send(
        &self,
        user: &User,
        confirmation_token: &str,
        action: ActionType,
    ) -> Result<(), DeliveryError> {
        info!(email = %user.email, action = %action, "Confirmation requested");
        debug!(email = %user.email, confirmation_token, "Confirmation token");
        Ok(())
    }
}

/// A delivered confirmation, as captured by [`MemoryOutbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub user_id: String,
    pub email: String,
    pub confirmation_token: String,
    pub action: ActionType,
}

/// Keeps every delivery in memory, for embedding and tests.
#[derive(Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<Delivered>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, oldest first.
    pub async fn sent(&self) -> Vec<Delivered> {
        self.sent.lock().await.clone()
    }

    /// Most recent token delivered to `email`.
    pub async fn last_token_for(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|d| d.email == email)
            .map(|d| d.confirmation_token.clone())
    }
}

#[async_trait]
impl DeliveryChannel for MemoryOutbox {
    async fn send(
        &self,
        user: &User,
        confirmation_token: &str,
        action: ActionType,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().await.push(Delivered {
            user_id: user.id.clone(),
            email: user.email.clone(),
            confirmation_token: confirmation_token.to_string(),
            action,
        });
        Ok(())
    }
}
