//! Credential signing and verification.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use panelgate_core::db::unix_timestamp;
use sha2::{Digest, Sha256};

use super::claims::Claims;
use crate::storage::Role;

/// Signs and verifies panel credentials with an HMAC secret.
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
}

impl JwtManager {
    pub fn new(secret: &[u8], ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    /// Sign a credential bound to an already-registered token ID.
    pub fn sign(
        &self,
        token_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = unix_timestamp();
        let claims = Claims {
            jti: token_id.to_string(),
            sub: user_id.to_string(),
            role,
            iat: now,
            exp: now + self.ttl_secs,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Check signature and expiry. Revocation is checked separately against
    /// the token registry.
    pub fn verify(&self, credential: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data =
            jsonwebtoken::decode::<Claims>(credential, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }

    pub const fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Hash a secret for storage; raw confirmation tokens are never persisted.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
