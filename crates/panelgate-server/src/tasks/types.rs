//! Task type, status and read-side projection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::AsyncTaskRow;

/// Long-running operations executed by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    ChangeLinuxPassword,
    InviteUser,
    InviteExistingUser,
    ResetVncPassword,
    InitializeVnc,
    GenerateSshKey,
    ChangeSshKey,
}

impl TaskType {
    pub const ALL: [Self; 7] = [
        Self::ChangeLinuxPassword,
        Self::InviteUser,
        Self::InviteExistingUser,
        Self::ResetVncPassword,
        Self::InitializeVnc,
        Self::GenerateSshKey,
        Self::ChangeSshKey,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChangeLinuxPassword => "change-linux-password",
            Self::InviteUser => "invite-user",
            Self::InviteExistingUser => "invite-existing-user",
            Self::ResetVncPassword => "reset-vnc-password",
            Self::InitializeVnc => "initialize-vnc",
            Self::GenerateSshKey => "generate-ssh-key",
            Self::ChangeSshKey => "change-ssh-key",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown task type: {s}")))
    }
}

/// Task lifecycle: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown task status: {other}"))),
        }
    }
}

/// Read-only view of a task. `result` is set iff completed, `error` iff
/// failed.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub owner_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<AsyncTaskRow> for TaskView {
    type Error = Error;

    fn try_from(row: AsyncTaskRow) -> Result<Self> {
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| Error::Internal(format!("corrupt task result: {e}")))?;
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            owner_id: row.user_id,
            task_type: row.task_type,
            result,
            error: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
