//! Operation log.
//!
//! Every service that changes state appends one entry per attempt, whether
//! it succeeded or not. Appending is fire-and-forget: a failed write is
//! logged and never reaches the operation being audited.

use tracing::warn;

use crate::auth::Principal;
use crate::error::Result;
use crate::storage::{LogPage, NewOperationLog, PanelDatabase};

/// Entry for one attempted operation. Successes get result code 0, failures
/// the error's [`result_code`](crate::Error::result_code) and message.
pub fn attempt<T>(
    user_id: Option<&str>,
    endpoint: &str,
    method: &str,
    result: &Result<T>,
) -> NewOperationLog {
    let (result_code, result_message) = match result {
        Ok(_) => (0, None),
        Err(e) => (e.result_code(), Some(e.to_string())),
    };
    NewOperationLog {
        user_id: user_id.map(str::to_string),
        endpoint: endpoint.to_string(),
        method: method.to_string(),
        result_code,
        result_message,
        ..NewOperationLog::default()
    }
}

/// Largest page returned by [`OperationLogReader::list`].
pub const MAX_PAGE_SIZE: u32 = 200;

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: NewOperationLog);
}

/// Discards every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn append(&self, _entry: NewOperationLog) {}
}

/// Writes entries to the `operation_logs` table on a background task.
#[derive(Clone)]
pub struct DbAuditSink {
    db: PanelDatabase,
}

impl DbAuditSink {
    pub fn new(db: PanelDatabase) -> Self {
        Self { db }
    }
}

impl AuditSink for DbAuditSink {
    fn append(&self, entry: NewOperationLog) {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.insert_operation_log(&entry).await {
                warn!(endpoint = %entry.endpoint, error = %e, "Failed to write operation log");
            }
        });
    }
}

/// Paginated reads of the operation log.
#[derive(Clone)]
pub struct OperationLogReader {
    db: PanelDatabase,
}

impl OperationLogReader {
    pub fn new(db: PanelDatabase) -> Self {
        Self { db }
    }

    /// Administrators read every entry, or one user's with `user_id`;
    /// everyone else reads only their own.
    pub async fn list(
        &self,
        actor: &Principal,
        user_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<LogPage> {
        let filter = if actor.role.is_admin() {
            user_id
        } else {
            Some(actor.user_id.as_str())
        };
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self.db.list_operation_logs(filter, limit, offset).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::Role;
    use std::time::Duration;

    fn entry(user_id: &str, endpoint: &str) -> NewOperationLog {
        NewOperationLog {
            user_id: Some(user_id.into()),
            endpoint: endpoint.into(),
            method: "confirm".into(),
            result_code: 0,
            ..NewOperationLog::default()
        }
    }

    async fn wait_for(reader: &OperationLogReader, admin: &Principal, total: i64) -> LogPage {
        for _ in 0..100 {
            let page = reader.list(admin, None, 50, 0).await.unwrap();
            if page.total >= total {
                return page;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("audit entries were not written");
    }

    #[tokio::test]
    async fn appended_entries_become_visible() {
        let db = PanelDatabase::open_in_memory().await.unwrap();
        let sink = DbAuditSink::new(db.clone());
        let reader = OperationLogReader::new(db);
        let admin = Principal::new("root", Role::Admin);

        sink.append(entry("alice", "tasks"));
        sink.append(entry("bob", "bookings"));

        let page = wait_for(&reader, &admin, 2).await;
        assert_eq!(page.entries.len(), 2);
    }

    #[test]
    fn attempt_records_error_code_and_message() {
        let ok: Result<()> = Ok(());
        let entry = attempt(Some("alice"), "bookings", "cancel", &ok);
        assert_eq!(entry.result_code, 0);
        assert!(entry.result_message.is_none());

        let denied: Result<()> = Err(crate::Error::Forbidden("not yours".into()));
        let entry = attempt(Some("alice"), "bookings", "cancel", &denied);
        assert_eq!(entry.result_code, 403);
        assert!(entry.result_message.unwrap().contains("not yours"));
        assert_eq!(entry.user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn users_only_read_their_own_entries() {
        let db = PanelDatabase::open_in_memory().await.unwrap();
        for user in ["alice", "alice", "bob"] {
            db.insert_operation_log(&entry(user, "tasks")).await.unwrap();
        }
        let reader = OperationLogReader::new(db);

        let alice = Principal::new("alice", Role::User);
        let page = reader.list(&alice, Some("bob"), 50, 0).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(
            page.entries
                .iter()
                .all(|e| e.user_id.as_deref() == Some("alice"))
        );

        let admin = Principal::new("root", Role::Admin);
        assert_eq!(reader.list(&admin, Some("bob"), 50, 0).await.unwrap().total, 1);
        assert_eq!(reader.list(&admin, None, 50, 0).await.unwrap().total, 3);
    }
}
