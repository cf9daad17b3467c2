//! SQLite database for the panelgate engine.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, Transaction};

pub use panelgate_core::db::DatabaseError;

panelgate_core::define_database!(PanelDatabase, "Panel database migrations complete");

/// Transaction handle shared by multi-step check-and-act sequences.
pub type Tx = Transaction<'static, Sqlite>;

impl PanelDatabase {
    /// Start a deferred transaction on a pooled connection.
    pub async fn begin(&self) -> Result<Tx, DatabaseError> {
        Ok(self.pool().begin().await?)
    }

    /// Check out a single connection for helpers that take `&mut SqliteConnection`.
    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Sqlite>, DatabaseError> {
        Ok(self.pool().acquire().await?)
    }
}
