//! Login, credential checks and account administration.

use std::sync::Arc;

use panelgate_core::config::BootstrapAdmin;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::Principal;
use super::jwt::JwtManager;
use super::password::{hash_password, verify_password};
use super::policy;
use crate::audit::{AuditSink, NullAudit, attempt};
use crate::error::{Error, Result};
use crate::pending::{ActionType, PendingActionEngine};
use crate::storage::{DatabaseError, NewOperationLog, NewUser, PanelDatabase, Role, User};
use crate::tokens::TokenRegistry;

/// Result of a password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Known device: a credential was issued.
    Authenticated { credential: String, token_id: String },
    /// Unknown device: a `login-2fa` confirmation was sent to the user.
    ConfirmationRequired,
}

/// A verified, non-revoked credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub principal: Principal,
    pub token_id: String,
    pub expires_at: i64,
}

/// Account created directly by an administrator.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub server_username: &'a str,
    pub password: &'a str,
    pub role: Role,
}

#[derive(Clone)]
pub struct AuthService {
    db: PanelDatabase,
    jwt: JwtManager,
    tokens: TokenRegistry,
    pending: PendingActionEngine,
    audit: Arc<dyn AuditSink>,
}

impl AuthService {
    pub fn new(
        db: PanelDatabase,
        jwt: JwtManager,
        tokens: TokenRegistry,
        pending: PendingActionEngine,
    ) -> Self {
        Self {
            db,
            jwt,
            tokens,
            pending,
            audit: Arc::new(NullAudit),
        }
    }

    /// Record logins, logouts and account administration in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Check a password and either issue a credential for a known device or
    /// start a `login-2fa` confirmation for a new one.
    ///
    /// Failed attempts are audited without a user, so unknown emails and
    /// wrong passwords leave identical entries.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        fingerprint: &str,
        ip_address: Option<&str>,
    ) -> Result<LoginOutcome> {
        let result = self.check_login(email, password, fingerprint, ip_address).await;
        let user_id = result.as_ref().ok().map(|(user_id, _)| user_id.as_str());
        self.audit.append(NewOperationLog {
            params: Some(json!({ "email": email }).to_string()),
            ip_address: ip_address.map(str::to_string),
            ..attempt(user_id, "auth", "login", &result)
        });
        result.map(|(_, outcome)| outcome)
    }

    #[instrument(skip(self, password, fingerprint))]
    async fn check_login(
        &self,
        email: &str,
        password: &str,
        fingerprint: &str,
        ip_address: Option<&str>,
    ) -> Result<(String, LoginOutcome)> {
        let user = match self.db.get_user_by_email(email).await {
            Ok(user) => user,
            Err(DatabaseError::NotFound(_)) => return Err(invalid_credentials()),
            Err(e) => return Err(e.into()),
        };
        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "Login with wrong password");
            return Err(invalid_credentials());
        }
        if !user.is_active {
            return Err(Error::Unauthenticated("account is deactivated".into()));
        }

        if self.db.touch_fingerprint(&user.id, fingerprint).await? {
            let token_id = self
                .tokens
                .issue(&user.id, Some(fingerprint), ip_address)
                .await?;
            let credential = self.sign(&token_id, &user)?;
            info!(user_id = %user.id, "Login from known device");
            return Ok((
                user.id,
                LoginOutcome::Authenticated {
                    credential,
                    token_id,
                },
            ));
        }

        self.pending
            .create(
                &user.id,
                ActionType::Login2fa,
                &json!({ "fingerprint": fingerprint, "ip_address": ip_address }),
            )
            .await?;
        info!(user_id = %user.id, "Login from new device, confirmation sent");
        Ok((user.id, LoginOutcome::ConfirmationRequired))
    }

    /// Resolve a bearer credential to its caller. Fails for bad signatures,
    /// expired or revoked credentials and deactivated accounts.
    pub async fn authenticate(&self, credential: &str) -> Result<Session> {
        let claims = self
            .jwt
            .verify(credential)
            .map_err(|e| Error::Unauthenticated(format!("invalid credential: {e}")))?;

        if !self.tokens.is_active(&claims.jti).await? {
            return Err(Error::Unauthenticated("credential revoked".into()));
        }
        let user = match self.db.get_user(&claims.sub).await {
            Ok(user) => user,
            Err(DatabaseError::NotFound(_)) => {
                return Err(Error::Unauthenticated("unknown account".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if !user.is_active {
            return Err(Error::Unauthenticated("account is deactivated".into()));
        }

        Ok(Session {
            principal: Principal::new(user.id.clone(), user.role()),
            token_id: claims.jti,
            expires_at: claims.exp,
        })
    }

    pub async fn logout(&self, session: &Session) -> Result<()> {
        let result = self.tokens.revoke(&session.token_id).await.map(|_| ());
        self.record(&session.principal.user_id, "auth", "logout", None, &result);
        result
    }

    /// Revoke every credential of the caller and forget their devices.
    pub async fn logout_all(&self, user_id: &str) -> Result<u64> {
        let result = async {
            let forgotten = self.db.delete_fingerprints(user_id).await?;
            let revoked = self.tokens.revoke_all(user_id).await?;
            info!(user_id, revoked, forgotten, "Logged out everywhere");
            Ok::<_, Error>(revoked)
        }
        .await;
        self.record(user_id, "auth", "logout-all", None, &result);
        result
    }

    /// Sign a credential for a token ID that is already registered.
    pub fn sign(&self, token_id: &str, user: &User) -> Result<String> {
        self.jwt
            .sign(token_id, &user.id, user.role())
            .map_err(|e| Error::Internal(format!("failed to sign credential: {e}")))
    }

    /// Create the first administrator if there is none.
    pub async fn bootstrap_admin(&self, admin: &BootstrapAdmin) -> Result<Option<User>> {
        if self.db.count_admins().await? > 0 {
            return Ok(None);
        }
        let password_hash = hash_password(&admin.password)?;
        let user = self
            .db
            .create_user(&NewUser {
                email: &admin.email,
                server_username: &admin.server_username,
                name: &admin.name,
                password_hash: &password_hash,
                role: Role::Admin,
            })
            .await?;
        info!(user_id = %user.id, email = %user.email, "Bootstrap administrator created");
        Ok(Some(user))
    }

    /// Create an account with a chosen password. Administrators only.
    pub async fn create_account(&self, actor: &Principal, account: &NewAccount<'_>) -> Result<User> {
        let result = self.insert_account(actor, account).await;
        let params = json!({
            "email": account.email,
            "server_username": account.server_username,
            "role": account.role,
        });
        self.record(&actor.user_id, "users", "create", Some(params.to_string()), &result);
        result
    }

    #[instrument(skip(self, actor, account), fields(actor = %actor.user_id, email = account.email))]
    async fn insert_account(&self, actor: &Principal, account: &NewAccount<'_>) -> Result<User> {
        actor.require_admin()?;
        policy::validate(account.password, account.server_username)
            .map_err(|v| Error::Validation(v.to_string()))?;

        let password_hash = hash_password(account.password)?;
        let user = self
            .db
            .create_user(&NewUser {
                email: account.email,
                server_username: account.server_username,
                name: account.name,
                password_hash: &password_hash,
                role: account.role,
            })
            .await?;
        info!(user_id = %user.id, "Account created");
        Ok(user)
    }

    /// Deactivate an account and revoke its credentials.
    pub async fn deactivate(&self, actor: &Principal, user_id: &str) -> Result<()> {
        let result = self.set_inactive(actor, user_id).await;
        let params = json!({ "user_id": user_id }).to_string();
        self.record(&actor.user_id, "users", "deactivate", Some(params), &result);
        result
    }

    async fn set_inactive(&self, actor: &Principal, user_id: &str) -> Result<()> {
        actor.require_admin()?;
        if actor.user_id == user_id {
            return Err(Error::Conflict("administrators cannot deactivate themselves".into()));
        }
        if !self.db.set_user_active(user_id, false).await? {
            return Err(Error::NotFound(format!("User {user_id}")));
        }
        let revoked = self.tokens.revoke_all(user_id).await?;
        info!(user_id, revoked, actor = %actor.user_id, "Account deactivated");
        Ok(())
    }

    pub async fn reactivate(&self, actor: &Principal, user_id: &str) -> Result<()> {
        let result = async {
            actor.require_admin()?;
            if !self.db.set_user_active(user_id, true).await? {
                return Err(Error::NotFound(format!("User {user_id}")));
            }
            info!(user_id, actor = %actor.user_id, "Account reactivated");
            Ok::<_, Error>(())
        }
        .await;
        let params = json!({ "user_id": user_id }).to_string();
        self.record(&actor.user_id, "users", "reactivate", Some(params), &result);
        result
    }

    pub async fn list_users(&self, actor: &Principal) -> Result<Vec<User>> {
        actor.require_admin()?;
        Ok(self.db.list_users().await?)
    }
}

impl AuthService {
    fn record<T>(
        &self,
        user_id: &str,
        endpoint: &str,
        method: &str,
        params: Option<String>,
        result: &Result<T>,
    ) {
        self.audit.append(NewOperationLog {
            params,
            ..attempt(Some(user_id), endpoint, method, result)
        });
    }
}

fn invalid_credentials() -> Error {
    Error::Unauthenticated("invalid email or password".into())
}
