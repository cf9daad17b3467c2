//! Data models for panelgate storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Account role, checked at every operation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub server_username: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
    pub last_email_sent_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// Parsed role. The schema only admits known values; anything else is
    /// treated as the least privileged role.
    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::User)
    }
}

/// Input for a new user row.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub server_username: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub role: Role,
}

/// Device signature a user has already confirmed a login from.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fingerprint {
    pub id: i64,
    pub user_id: String,
    pub fingerprint: String,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// A credential that has not been revoked.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActiveToken {
    pub id: i64,
    pub user_id: String,
    pub token_id: String,
    pub fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: i64,
}

/// Stored pending action. Only the hash of the confirmation token is kept.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingActionRow {
    pub id: i64,
    pub user_id: String,
    pub token_hash: String,
    pub action_type: String,
    pub payload: String,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AsyncTaskRow {
    pub id: String,
    pub user_id: String,
    pub task_type: String,
    pub status: String,
    pub payload: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperationLog {
    pub id: i64,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub params: Option<String>,
    pub result_code: i64,
    pub result_message: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: i64,
}

/// Audit entry before it is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOperationLog {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub params: Option<String>,
    pub result_code: i64,
    pub result_message: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub user_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub cpu_cores: i64,
    pub ram_gb: i64,
    pub gpu_ram_gb: i64,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Column values shared by booking inserts and updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSlot {
    pub start_time: i64,
    pub end_time: i64,
    pub cpu_cores: i64,
    pub ram_gb: i64,
    pub gpu_ram_gb: i64,
    pub description: String,
}
