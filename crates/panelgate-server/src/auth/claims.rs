//! Claims carried by signed panel credentials.

use serde::{Deserialize, Serialize};

use crate::storage::Role;

/// JWT claims embedded in credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Token ID; the credential is only honoured while this ID is registered
    /// as active.
    pub jti: String,
    /// Subject (user ID).
    pub sub: String,
    pub role: Role,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

impl Claims {
    pub const fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}
