//! Error taxonomy surfaced by the panelgate engine.

use std::fmt;

use panelgate_core::db::DatabaseError;

/// A bookable resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    Cpu,
    Ram,
    GpuRam,
}

impl ResourceDimension {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu_cores",
            Self::Ram => "ram_gb",
            Self::GpuRam => "gpu_ram_gb",
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, unknown action or task type, policy violation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Confirmation token is unknown, already used or expired.
    #[error("Confirmation token not found or expired")]
    NotFoundOrExpired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Capacity exceeded on {dimension} at {at}: {requested} requested, {capacity} available"
    )]
    CapacityExceeded {
        dimension: ResourceDimension,
        /// First instant (unix seconds) at which the limit is broken.
        at: i64,
        /// Peak demand at `at`, including the proposed booking.
        requested: i64,
        capacity: i64,
    },

    #[error("Too many confirmation requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for Error {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::UniqueViolation(what) => Self::Conflict(what),
            other => Self::Database(other),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        DatabaseError::from(e).into()
    }
}

impl Error {
    /// HTTP-style code recorded in the operation log.
    pub const fn result_code(&self) -> i64 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFoundOrExpired | Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::CapacityExceeded { .. } => 409,
            Self::RateLimited { .. } => 429,
            Self::Internal(_) | Self::Database(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
