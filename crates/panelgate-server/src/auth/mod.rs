//! Authentication for the panel.
//!
//! Credentials are signed JWTs whose token ID must also be present in the
//! active-token registry. Logins from unknown devices go through a
//! `login-2fa` confirmation before a credential is issued.

pub mod claims;
pub mod jwt;
pub mod password;
pub mod policy;
pub mod service;

pub use claims::Claims;
pub use jwt::JwtManager;
pub use service::{AuthService, LoginOutcome, NewAccount, Session};

use crate::storage::Role;

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    /// Whether the caller may act on a resource owned by `owner_id`.
    pub fn owns_or_admin(&self, owner_id: &str) -> bool {
        self.role.is_admin() || self.user_id == owner_id
    }

    /// Fail with `Forbidden` unless the caller is an administrator.
    pub fn require_admin(&self) -> crate::Result<()> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(crate::Error::Forbidden("administrator role required".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_and_admin_override() {
        let alice = Principal::new("alice", Role::User);
        let admin = Principal::new("root", Role::Admin);

        assert!(alice.owns_or_admin("alice"));
        assert!(!alice.owns_or_admin("bob"));
        assert!(admin.owns_or_admin("bob"));
        assert!(alice.require_admin().is_err());
        assert!(admin.require_admin().is_ok());
    }
}
