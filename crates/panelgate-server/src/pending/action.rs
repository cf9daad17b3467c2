//! Action types and their payload schemas.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::policy;
use crate::error::{Error, Result};
use crate::storage::Role;
use crate::tasks::TaskType;

/// Operations that require out-of-band confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    #[serde(rename = "login-2fa")]
    Login2fa,
    ChangePassword,
    ChangeLinuxPassword,
    InviteUser,
    InviteExistingUser,
    ResetVncPassword,
    InitializeVnc,
    GenerateSshKey,
    ChangeSshKey,
}

impl ActionType {
    pub const ALL: [Self; 9] = [
        Self::Login2fa,
        Self::ChangePassword,
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
            Self::Login2fa => "login-2fa",
            Self::ChangePassword => "change-password",
            Self::ChangeLinuxPassword => "change-linux-password",
            Self::InviteUser => "invite-user",
            Self::InviteExistingUser => "invite-existing-user",
            Self::ResetVncPassword => "reset-vnc-password",
            Self::InitializeVnc => "initialize-vnc",
            Self::GenerateSshKey => "generate-ssh-key",
            Self::ChangeSshKey => "change-ssh-key",
        }
    }

    /// The task a confirmed action turns into. `None` for actions that
    /// complete synchronously on confirmation.
    pub const fn task_type(self) -> Option<TaskType> {
        match self {
            Self::Login2fa | Self::ChangePassword => None,
            Self::ChangeLinuxPassword => Some(TaskType::ChangeLinuxPassword),
            Self::InviteUser => Some(TaskType::InviteUser),
            Self::InviteExistingUser => Some(TaskType::InviteExistingUser),
            Self::ResetVncPassword => Some(TaskType::ResetVncPassword),
            Self::InitializeVnc => Some(TaskType::InitializeVnc),
            Self::GenerateSshKey => Some(TaskType::GenerateSshKey),
            Self::ChangeSshKey => Some(TaskType::ChangeSshKey),
        }
    }

    /// Whether only administrators may request this action.
    pub const fn requires_admin(self) -> bool {
        matches!(self, Self::InviteUser | Self::InviteExistingUser)
    }

}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown action type: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginTwoFactor {
    pub fingerprint: String,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Payload of every action that sets a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPassword {
    pub new_password: String,
}

/// A new panel account backed by a server account created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InviteUser {
    pub email: String,
    pub name: String,
    pub server_username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    /// Must be one of the configured home volumes.
    pub home_volume: String,
}

/// A panel account for a server account that already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InviteExistingUser {
    pub email: String,
    pub name: String,
    pub server_username: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

const fn default_role() -> Role {
    Role::User
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshPublicKey {
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoFields {}

/// A payload that passed its action's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    Login2fa(LoginTwoFactor),
    ChangePassword(NewPassword),
    ChangeLinuxPassword(NewPassword),
    InviteUser(InviteUser),
    InviteExistingUser(InviteExistingUser),
    ResetVncPassword(NewPassword),
    InitializeVnc(NewPassword),
    GenerateSshKey,
    ChangeSshKey(SshPublicKey),
}

impl ActionPayload {
    /// Parse and validate `payload` for `action`. `server_username` is the
    /// requesting account, which passwords must not contain.
    pub fn parse(action: ActionType, payload: &Value, server_username: &str) -> Result<Self> {
        let parsed = match action {
            ActionType::Login2fa => {
                let p: LoginTwoFactor = decode(action, payload)?;
                if p.fingerprint.trim().is_empty() {
                    return Err(Error::Validation("fingerprint must not be empty".into()));
                }
                Self::Login2fa(p)
            }
            ActionType::ChangePassword => {
                Self::ChangePassword(password(action, payload, server_username)?)
            }
            ActionType::ChangeLinuxPassword => {
                Self::ChangeLinuxPassword(password(action, payload, server_username)?)
            }
            ActionType::ResetVncPassword => {
                Self::ResetVncPassword(password(action, payload, server_username)?)
            }
            ActionType::InitializeVnc => {
                Self::InitializeVnc(password(action, payload, server_username)?)
            }
            ActionType::InviteUser => {
                let p: InviteUser = decode(action, payload)?;
                validate_invitee(&p.email, &p.name, &p.server_username)?;
                Self::InviteUser(p)
            }
            ActionType::InviteExistingUser => {
                let p: InviteExistingUser = decode(action, payload)?;
                validate_invitee(&p.email, &p.name, &p.server_username)?;
                if p.server_username == "root" {
                    return Err(Error::Validation("root cannot be invited".into()));
                }
                Self::InviteExistingUser(p)
            }
            ActionType::GenerateSshKey => {
                let _: NoFields = decode(action, payload)?;
                Self::GenerateSshKey
            }
            ActionType::ChangeSshKey => {
                let p: SshPublicKey = decode(action, payload)?;
                validate_public_key(&p.public_key)?;
                Self::ChangeSshKey(p)
            }
        };
        Ok(parsed)
    }

    /// Decode a payload that was validated when it was stored.
    pub fn from_stored(action: ActionType, payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::Internal(format!("corrupt stored payload: {e}")))?;
        let parsed = match action {
            ActionType::Login2fa => Self::Login2fa(decode(action, &value)?),
            ActionType::ChangePassword => Self::ChangePassword(decode(action, &value)?),
            ActionType::ChangeLinuxPassword => Self::ChangeLinuxPassword(decode(action, &value)?),
            ActionType::InviteUser => Self::InviteUser(decode(action, &value)?),
            ActionType::InviteExistingUser => Self::InviteExistingUser(decode(action, &value)?),
            ActionType::ResetVncPassword => Self::ResetVncPassword(decode(action, &value)?),
            ActionType::InitializeVnc => Self::InitializeVnc(decode(action, &value)?),
            ActionType::GenerateSshKey => Self::GenerateSshKey,
            ActionType::ChangeSshKey => Self::ChangeSshKey(decode(action, &value)?),
        };
        Ok(parsed)
    }

    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::Login2fa(_) => ActionType::Login2fa,
            Self::ChangePassword(_) => ActionType::ChangePassword,
            Self::ChangeLinuxPassword(_) => ActionType::ChangeLinuxPassword,
            Self::InviteUser(_) => ActionType::InviteUser,
            Self::InviteExistingUser(_) => ActionType::InviteExistingUser,
            Self::ResetVncPassword(_) => ActionType::ResetVncPassword,
            Self::InitializeVnc(_) => ActionType::InitializeVnc,
            Self::GenerateSshKey => ActionType::GenerateSshKey,
            Self::ChangeSshKey(_) => ActionType::ChangeSshKey,
        }
    }

    /// Email and server username of the account an invitation would create.
    pub fn invitee(&self) -> Option<(&str, &str)> {
        match self {
            Self::InviteUser(p) => Some((p.email.as_str(), p.server_username.as_str())),
            Self::InviteExistingUser(p) => Some((p.email.as_str(), p.server_username.as_str())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        let value = match self {
            Self::Login2fa(p) => serde_json::to_value(p),
            Self::ChangePassword(p)
            | Self::ChangeLinuxPassword(p)
            | Self::ResetVncPassword(p)
            | Self::InitializeVnc(p) => serde_json::to_value(p),
            Self::InviteUser(p) => serde_json::to_value(p),
            Self::InviteExistingUser(p) => serde_json::to_value(p),
            Self::GenerateSshKey => Ok(Value::Object(serde_json::Map::new())),
            Self::ChangeSshKey(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }
}

fn decode<T: DeserializeOwned>(action: ActionType, payload: &Value) -> Result<T> {
    T::deserialize(payload)
        .map_err(|e| Error::Validation(format!("invalid payload for {action}: {e}")))
}

fn password(action: ActionType, payload: &Value, server_username: &str) -> Result<NewPassword> {
    let p: NewPassword = decode(action, payload)?;
    policy::validate(&p.new_password, server_username)
        .map_err(|violation| Error::Validation(violation.to_string()))?;
    Ok(p)
}

fn validate_invitee(email: &str, name: &str, server_username: &str) -> Result<()> {
    let email_ok = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !email_ok {
        return Err(Error::Validation(format!("invalid email: {email}")));
    }
    if name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    if !is_valid_login_name(server_username) {
        return Err(Error::Validation(format!(
            "invalid server username: {server_username}"
        )));
    }
    Ok(())
}

/// Conservative POSIX login name: lowercase letter or underscore, then up
/// to 31 lowercase letters, digits, `_` or `-`.
fn is_valid_login_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 32
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

const KEY_PREFIXES: [&str; 4] = ["ssh-ed25519", "ssh-rsa", "ecdsa-sha2-", "sk-"];

fn validate_public_key(key: &str) -> Result<()> {
    let mut fields = key.split_whitespace();
    let algo_ok = fields
        .next()
        .is_some_and(|algo| KEY_PREFIXES.iter().any(|p| algo.starts_with(p)));
    let body_ok = fields.next().is_some_and(|body| body.len() >= 16);
    if !(algo_ok && body_ok) || key.contains('\n') {
        return Err(Error::Validation("invalid SSH public key".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_round_trips_through_str() {
        for action in ActionType::ALL {
            assert_eq!(action.as_str().parse::<ActionType>().unwrap(), action);
        }
        assert!(matches!(
            "format-disk".parse::<ActionType>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn serde_names_match_as_str() {
        assert_eq!(
            serde_json::to_value(ActionType::Login2fa).unwrap(),
            json!("login-2fa")
        );
        assert_eq!(
            serde_json::to_value(ActionType::ResetVncPassword).unwrap(),
            json!("reset-vnc-password")
        );
    }

    #[test]
    fn only_login_and_panel_password_are_synchronous() {
        let sync: Vec<_> = ActionType::ALL
            .into_iter()
            .filter(|a| a.task_type().is_none())
            .collect();
        assert_eq!(sync, [ActionType::Login2fa, ActionType::ChangePassword]);
    }

    #[test]
    fn password_payload_checks_policy() {
        let weak = json!({ "new_password": "password" });
        assert!(ActionPayload::parse(ActionType::ResetVncPassword, &weak, "alice").is_err());

        let strong = json!({ "new_password": "Vnc-Pass92x" });
        let parsed = ActionPayload::parse(ActionType::ResetVncPassword, &strong, "alice").unwrap();
        assert_eq!(parsed.action_type(), ActionType::ResetVncPassword);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let payload = json!({ "new_password": "Vnc-Pass92x", "sudo": true });
        assert!(ActionPayload::parse(ActionType::InitializeVnc, &payload, "alice").is_err());
        assert!(ActionPayload::parse(ActionType::GenerateSshKey, &json!({ "x": 1 }), "a").is_err());
    }

    #[test]
    fn generate_ssh_key_takes_empty_object() {
        let parsed = ActionPayload::parse(ActionType::GenerateSshKey, &json!({}), "alice").unwrap();
        assert_eq!(parsed, ActionPayload::GenerateSshKey);
        assert_eq!(parsed.to_json(), json!({}));
    }

    #[test]
    fn invite_validates_fields() {
        let good = json!({
            "email": "bob@example.com",
            "name": "Bob",
            "server_username": "bob",
            "home_volume": "/volumes/home",
        });
        let parsed = ActionPayload::parse(ActionType::InviteUser, &good, "admin").unwrap();
        assert_eq!(parsed.invitee(), Some(("bob@example.com", "bob")));
        let ActionPayload::InviteUser(invite) = parsed else {
            unreachable!()
        };
        assert_eq!(invite.role, Role::User);

        let no_volume = json!({ "email": "bob@example.com", "name": "Bob", "server_username": "bob" });
        assert!(ActionPayload::parse(ActionType::InviteUser, &no_volume, "admin").is_err());

        let bad_login = json!({ "email": "bob@example.com", "name": "Bob", "server_username": "Bob;rm" });
        assert!(ActionPayload::parse(ActionType::InviteUser, &bad_login, "admin").is_err());

        let bad_email = json!({ "email": "bob", "name": "Bob", "server_username": "bob" });
        assert!(ActionPayload::parse(ActionType::InviteUser, &bad_email, "admin").is_err());
    }

    #[test]
    fn existing_user_invite_refuses_root() {
        let bob = json!({ "email": "bob@example.com", "name": "Bob", "server_username": "bob", "role": "admin" });
        let ActionPayload::InviteExistingUser(invite) =
            ActionPayload::parse(ActionType::InviteExistingUser, &bob, "admin").unwrap()
        else {
            unreachable!()
        };
        assert_eq!(invite.role, Role::Admin);

        let root = json!({ "email": "root@example.com", "name": "Root", "server_username": "root" });
        assert!(matches!(
            ActionPayload::parse(ActionType::InviteExistingUser, &root, "admin"),
            Err(Error::Validation(_))
        ));

        // The account already exists, so there is no home volume to choose.
        let with_volume = json!({
            "email": "bob@example.com",
            "name": "Bob",
            "server_username": "bob",
            "home_volume": "/volumes/home",
        });
        assert!(ActionPayload::parse(ActionType::InviteExistingUser, &with_volume, "admin").is_err());
    }

    #[test]
    fn public_key_shape_is_checked() {
        let good = json!({ "public_key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG alice@laptop" });
        assert!(ActionPayload::parse(ActionType::ChangeSshKey, &good, "alice").is_ok());

        let bad = json!({ "public_key": "hello world" });
        assert!(ActionPayload::parse(ActionType::ChangeSshKey, &bad, "alice").is_err());
    }

    #[test]
    fn stored_payload_round_trips() {
        let payload = ActionPayload::Login2fa(LoginTwoFactor {
            fingerprint: "laptop".into(),
            ip_address: Some("10.0.0.1".into()),
        });
        let stored = payload.to_json().to_string();
        assert_eq!(
            ActionPayload::from_stored(ActionType::Login2fa, &stored).unwrap(),
            payload
        );
    }
}
