//! Confirmation dispatcher.
//!
//! Consuming a token and carrying out its action happen in one transaction:
//! if the action cannot be applied the token stays valid, and a token that
//! was applied can never be applied again. Actions backed by a system
//! operation are persisted as tasks in that same transaction and queued
//! after commit.
//!
//! Task payloads may carry passwords. The stored copy loses them once the
//! task reaches a terminal status.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::audit::{AuditSink, attempt};
use crate::auth::password::hash_password;
use crate::auth::{JwtManager, policy};
use crate::error::{Error, Result};
use crate::pending::{ActionPayload, ActionType, ConsumedAction, PendingActionEngine};
use crate::storage::queries::{find_user, insert_user, update_password_hash, upsert_fingerprint};
use crate::storage::{NewOperationLog, NewUser, PanelDatabase, Role, Tx, User};
use crate::tasks::{PreparedTask, TaskEngine, TaskType};
use crate::tokens::TokenRegistry;

/// What a confirmation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// A `login-2fa` confirmation registered the device and issued a
    /// credential.
    LoggedIn { credential: String, token_id: String },
    /// The panel password changed; all previous credentials were revoked.
    PasswordChanged { revoked_tokens: u64 },
    /// A system operation was queued.
    TaskQueued {
        task_id: String,
        task_type: TaskType,
    },
}

#[derive(Clone)]
pub struct ConfirmationService {
    db: PanelDatabase,
    pending: PendingActionEngine,
    tokens: TokenRegistry,
    tasks: TaskEngine,
    jwt: JwtManager,
    audit: Arc<dyn AuditSink>,
}

impl ConfirmationService {
    pub fn new(
        db: PanelDatabase,
        pending: PendingActionEngine,
        tokens: TokenRegistry,
        tasks: TaskEngine,
        jwt: JwtManager,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            db,
            pending,
            tokens,
            tasks,
            jwt,
            audit,
        }
    }

    /// Consume `token` and perform its action. Every attempt is audited.
    #[instrument(skip_all)]
    pub async fn confirm(&self, token: &str, ip_address: Option<&str>) -> Result<ConfirmationOutcome> {
        let result = self.apply(token).await;
        let entry = match &result {
            Ok((user, action, _)) => NewOperationLog {
                username: Some(user.server_username.clone()),
                ..attempt(Some(user.id.as_str()), "confirm", action.as_str(), &result)
            },
            Err(_) => attempt(None, "confirm", "unknown", &result),
        };
        self.audit.append(NewOperationLog {
            ip_address: ip_address.map(str::to_string),
            ..entry
        });
        result.map(|(_, _, outcome)| outcome)
    }

    async fn apply(&self, token: &str) -> Result<(User, ActionType, ConfirmationOutcome)> {
        let mut tx = self.db.begin().await?;
        let ConsumedAction { user_id, payload } = self.pending.consume_in(&mut tx, token).await?;
        let user = find_user(&mut tx, &user_id).await?;
        if !user.is_active {
            return Err(Error::Forbidden("account is deactivated".into()));
        }
        let action = payload.action_type();

        let outcome = match payload {
            ActionPayload::Login2fa(p) => {
                upsert_fingerprint(&mut tx, &user.id, &p.fingerprint).await?;
                let token_id = self
                    .tokens
                    .issue_in(
                        &mut tx,
                        &user.id,
                        Some(&p.fingerprint),
                        p.ip_address.as_deref(),
                    )
                    .await?;
                let credential = self
                    .jwt
                    .sign(&token_id, &user.id, user.role())
                    .map_err(|e| Error::Internal(format!("failed to sign credential: {e}")))?;
                tx.commit().await?;
                info!(user_id = %user.id, "Device confirmed");
                ConfirmationOutcome::LoggedIn {
                    credential,
                    token_id,
                }
            }
            ActionPayload::ChangePassword(p) => {
                let hash = hash_password(&p.new_password)?;
                update_password_hash(&mut tx, &user.id, &hash).await?;
                let revoked_tokens = self.tokens.revoke_all_in(&mut tx, &user.id).await?;
                tx.commit().await?;
                info!(user_id = %user.id, revoked_tokens, "Panel password changed");
                ConfirmationOutcome::PasswordChanged { revoked_tokens }
            }
            ActionPayload::InviteUser(p) => {
                let invitee = Invitee {
                    email: &p.email,
                    name: &p.name,
                    server_username: &p.server_username,
                    role: p.role,
                };
                let extra = json!({ "home_volume": p.home_volume });
                self.invite(tx, &user, &invitee, TaskType::InviteUser, extra)
                    .await?
            }
            ActionPayload::InviteExistingUser(p) => {
                let invitee = Invitee {
                    email: &p.email,
                    name: &p.name,
                    server_username: &p.server_username,
                    role: p.role,
                };
                self.invite(tx, &user, &invitee, TaskType::InviteExistingUser, json!({}))
                    .await?
            }
            other => {
                let task_type = action
                    .task_type()
                    .ok_or_else(|| Error::Internal(format!("{action} has no task type")))?;
                let task_payload = with_account(other.to_json(), &user);
                let prepared = self
                    .tasks
                    .prepare_in(&mut tx, &user.id, task_type, task_payload)
                    .await?;
                tx.commit().await?;
                self.queued(prepared, task_type)
            }
        };
        Ok((user, action, outcome))
    }

    /// Create the invited account with a generated panel password and queue
    /// the task that provisions it and tells the invitee.
    async fn invite(
        &self,
        mut tx: Tx,
        inviter: &User,
        invitee: &Invitee<'_>,
        task_type: TaskType,
        extra: Value,
    ) -> Result<ConfirmationOutcome> {
        let initial_password = policy::generate(invitee.server_username);
        let hash = hash_password(&initial_password)?;
        let invited = insert_user(
            &mut tx,
            &NewUser {
                email: invitee.email,
                server_username: invitee.server_username,
                name: invitee.name,
                password_hash: &hash,
                role: invitee.role,
            },
        )
        .await?;

        let mut task_payload = json!({
            "user_id": invited.id,
            "email": invitee.email,
            "name": invitee.name,
            "server_username": invitee.server_username,
            "role": invitee.role,
            "initial_password": initial_password,
            "invited_by": inviter.name,
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut task_payload, extra) {
            map.extend(extra);
        }
        let prepared = self
            .tasks
            .prepare_in(&mut tx, &inviter.id, task_type, task_payload)
            .await?;
        tx.commit().await?;
        info!(user_id = %inviter.id, invited = %invited.id, task_type = %task_type, "User invited");
        Ok(self.queued(prepared, task_type))
    }

    fn queued(&self, prepared: PreparedTask, task_type: TaskType) -> ConfirmationOutcome {
        let task_id = self.tasks.dispatch(prepared);
        ConfirmationOutcome::TaskQueued { task_id, task_type }
    }
}

/// Account an invitation creates.
struct Invitee<'a> {
    email: &'a str,
    name: &'a str,
    server_username: &'a str,
    role: Role,
}

/// Add the account the operation applies to.
fn with_account(mut payload: Value, user: &User) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert("user_id".into(), Value::String(user.id.clone()));
        map.insert(
            "server_username".into(),
            Value::String(user.server_username.clone()),
        );
    }
    payload
}
