#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for step-up confirmation.
//!
//! Covers the full flow: create → out-of-band delivery → consume → action
//! applied (credential issued, password changed, task queued).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use panelgate_core::config::Config;
use serde_json::{Value, json};

use panelgate_server::Error;
use panelgate_server::app::Panel;
use panelgate_server::auth::password::hash_password;
use panelgate_server::auth::{LoginOutcome, policy};
use panelgate_server::confirm::ConfirmationOutcome;
use panelgate_server::delivery::{DeliveryChannel, MemoryOutbox};
use panelgate_server::pending::ActionType;
use panelgate_server::storage::{NewUser, PanelDatabase, Role, User};
use panelgate_server::tasks::{
    ExecutionError, ExecutorRegistry, TaskExecutor, TaskStatus, TaskType, TaskView,
};

const PASSWORD: &str = "Orbit-Lamp42";

/// Returns the payload it was given.
struct Echo;

#[async_trait]
impl TaskExecutor for Echo {
    async fn execute(&self, payload: Value) -> Result<Value, ExecutionError> {
        Ok(payload)
    }
}

fn all_executors() -> ExecutorRegistry {
    TaskType::ALL
        .into_iter()
        .fold(ExecutorRegistry::new(), |registry, task_type| {
            registry.with(task_type, Arc::new(Echo))
        })
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.confirmation.email_cooldown_secs = 0;
    config
}

fn panel_with(db: PanelDatabase, executors: ExecutorRegistry) -> (Panel, Arc<MemoryOutbox>) {
    let outbox = Arc::new(MemoryOutbox::new());
    let panel = Panel::build(
        &test_config(),
        db,
        Arc::clone(&outbox) as Arc<dyn DeliveryChannel>,
        executors,
    );
    (panel, outbox)
}

async fn create_user(db: &PanelDatabase, name: &str, role: Role) -> User {
    db.create_user(&NewUser {
        email: &format!("{name}@example.com"),
        server_username: name,
        name,
        password_hash: &hash_password(PASSWORD).unwrap(),
        role,
    })
    .await
    .unwrap()
}

async fn wait_terminal(panel: &Panel, task_id: &str) -> TaskView {
    for _ in 0..200 {
        let view = panel.tasks.status(task_id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish");
}

#[tokio::test]
async fn confirmation_token_is_single_use() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;

    let token = panel
        .pending
        .create_with_ttl(
            &alice.id,
            ActionType::ResetVncPassword,
            &json!({ "new_password": "Vnc-Pass92x" }),
            Duration::from_secs(15 * 60),
        )
        .await
        .unwrap();

    let ConfirmationOutcome::TaskQueued { task_id, task_type } =
        panel.confirmations.confirm(&token, None).await.unwrap()
    else {
        panic!("expected a queued task");
    };
    assert_eq!(task_type, TaskType::ResetVncPassword);

    assert!(matches!(
        panel.confirmations.confirm(&token, None).await,
        Err(Error::NotFoundOrExpired)
    ));

    // The executor sees the payload plus the account it applies to.
    let view = wait_terminal(&panel, &task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.owner_id, alice.id);
    let result = view.result.unwrap();
    assert_eq!(result["new_password"], "Vnc-Pass92x");
    assert_eq!(result["server_username"], "alice");

    // The password is not kept at rest once the task is done.
    let stored = db.get_task(&task_id).await.unwrap();
    assert!(!stored.payload.contains("Vnc-Pass92x"));
    assert!(stored.payload.contains("alice"));
}

#[tokio::test]
async fn expired_token_cannot_be_confirmed() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;

    let token = panel
        .pending
        .create_with_ttl(
            &alice.id,
            ActionType::GenerateSshKey,
            &json!({}),
            Duration::ZERO,
        )
        .await
        .unwrap();

    assert!(matches!(
        panel.confirmations.confirm(&token, None).await,
        Err(Error::NotFoundOrExpired)
    ));
    assert!(db.list_user_tasks(&alice.id, 50, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_confirmations_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = PanelDatabase::open(&dir.path().join("panel.db")).await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;

    let token = panel
        .pending
        .create(&alice.id, ActionType::GenerateSshKey, &json!({}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let confirmations = panel.confirmations.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            confirmations.confirm(&token, None).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ConfirmationOutcome::TaskQueued { .. }) => applied += 1,
            Err(Error::NotFoundOrExpired) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(db.list_user_tasks(&alice.id, 50, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn new_device_login_completes_through_confirmation() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, outbox) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;

    let outcome = panel
        .auth
        .login("alice@example.com", PASSWORD, "laptop-1", Some("10.0.0.7"))
        .await
        .unwrap();
    assert_eq!(outcome, LoginOutcome::ConfirmationRequired);

    let token = outbox.last_token_for("alice@example.com").await.unwrap();
    let ConfirmationOutcome::LoggedIn {
        credential,
        token_id,
    } = panel.confirmations.confirm(&token, None).await.unwrap()
    else {
        panic!("expected a credential");
    };

    let session = panel.auth.authenticate(&credential).await.unwrap();
    assert_eq!(session.principal.user_id, alice.id);
    assert_eq!(session.token_id, token_id);

    let tokens = panel.tokens.list(&alice.id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].ip_address.as_deref(), Some("10.0.0.7"));

    // The device is now known.
    assert!(matches!(
        panel
            .auth
            .login("alice@example.com", PASSWORD, "laptop-1", None)
            .await
            .unwrap(),
        LoginOutcome::Authenticated { .. }
    ));
}

#[tokio::test]
async fn password_change_revokes_every_credential() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;
    db.add_fingerprint(&alice.id, "laptop-1").await.unwrap();

    let LoginOutcome::Authenticated { credential, .. } = panel
        .auth
        .login("alice@example.com", PASSWORD, "laptop-1", None)
        .await
        .unwrap()
    else {
        panic!("expected a credential");
    };

    let token = panel
        .pending
        .create(
            &alice.id,
            ActionType::ChangePassword,
            &json!({ "new_password": "Fresh-Start71" }),
        )
        .await
        .unwrap();
    let outcome = panel.confirmations.confirm(&token, None).await.unwrap();
    assert_eq!(
        outcome,
        ConfirmationOutcome::PasswordChanged { revoked_tokens: 1 }
    );

    assert!(matches!(
        panel.auth.authenticate(&credential).await,
        Err(Error::Unauthenticated(_))
    ));
    assert!(matches!(
        panel
            .auth
            .login("alice@example.com", PASSWORD, "laptop-1", None)
            .await,
        Err(Error::Unauthenticated(_))
    ));
    assert!(matches!(
        panel
            .auth
            .login("alice@example.com", "Fresh-Start71", "laptop-1", None)
            .await,
        Ok(LoginOutcome::Authenticated { .. })
    ));
}

#[tokio::test]
async fn invitation_creates_account_and_provisioning_task() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, outbox) = panel_with(db.clone(), all_executors());
    let admin = create_user(&db, "root", Role::Admin).await;

    let token = panel
        .pending
        .create(
            &admin.id,
            ActionType::InviteUser,
            &json!({
                "email": "bob@example.com",
                "name": "Bob",
                "server_username": "bob",
                "home_volume": "/volumes/home",
            }),
        )
        .await
        .unwrap();
    let ConfirmationOutcome::TaskQueued { task_id, task_type } =
        panel.confirmations.confirm(&token, None).await.unwrap()
    else {
        panic!("expected a queued task");
    };
    assert_eq!(task_type, TaskType::InviteUser);

    let bob = db.get_user_by_email("bob@example.com").await.unwrap();
    assert_eq!(bob.role(), Role::User);

    let view = wait_terminal(&panel, &task_id).await;
    let provisioned = view.result.unwrap();
    assert_eq!(provisioned["server_username"], "bob");
    assert_eq!(provisioned["home_volume"], "/volumes/home");
    let initial = provisioned["initial_password"].as_str().unwrap();
    assert!(policy::validate(initial, "bob").is_ok());
    assert!(!db.get_task(&task_id).await.unwrap().payload.contains(initial));

    // The generated password is the account's panel password.
    assert_eq!(
        panel
            .auth
            .login("bob@example.com", initial, "phone", None)
            .await
            .unwrap(),
        LoginOutcome::ConfirmationRequired
    );
    assert!(outbox.last_token_for("bob@example.com").await.is_some());
}

#[tokio::test]
async fn existing_server_account_can_be_invited() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let admin = create_user(&db, "root", Role::Admin).await;

    let token = panel
        .pending
        .create(
            &admin.id,
            ActionType::InviteExistingUser,
            &json!({ "email": "carol@example.com", "name": "Carol", "server_username": "carol" }),
        )
        .await
        .unwrap();
    let ConfirmationOutcome::TaskQueued { task_id, task_type } =
        panel.confirmations.confirm(&token, None).await.unwrap()
    else {
        panic!("expected a queued task");
    };
    assert_eq!(task_type, TaskType::InviteExistingUser);

    let view = wait_terminal(&panel, &task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    let sent = view.result.unwrap();
    assert_eq!(sent["server_username"], "carol");
    assert!(sent.get("home_volume").is_none());
    assert!(
        db.get_user_by_server_username("carol")
            .await
            .unwrap()
            .is_active
    );
}

#[tokio::test]
async fn failed_action_leaves_token_usable() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    // No executors: queuing the task is rejected and the consume rolls back.
    let (panel, _) = panel_with(db.clone(), ExecutorRegistry::new());
    let alice = create_user(&db, "alice", Role::User).await;

    let token = panel
        .pending
        .create(&alice.id, ActionType::GenerateSshKey, &json!({}))
        .await
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(
            panel.confirmations.confirm(&token, None).await,
            Err(Error::Validation(_))
        ));
    }
    assert_eq!(db.count_pending_actions(&alice.id).await.unwrap(), 1);
}

#[tokio::test]
async fn confirmations_are_audited() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let (panel, _) = panel_with(db.clone(), all_executors());
    let alice = create_user(&db, "alice", Role::User).await;

    let token = panel
        .pending
        .create(&alice.id, ActionType::GenerateSshKey, &json!({}))
        .await
        .unwrap();
    panel.confirmations.confirm(&token, Some("10.0.0.9")).await.unwrap();
    let _ = panel.confirmations.confirm(&token, Some("10.0.0.9")).await;

    for _ in 0..100 {
        let page = db.list_operation_logs(None, 50, 0).await.unwrap();
        let mut codes: Vec<i64> = page
            .entries
            .iter()
            .filter(|e| e.endpoint == "confirm")
            .map(|e| e.result_code)
            .collect();
        if codes.len() == 2 {
            codes.sort_unstable();
            assert_eq!(codes, vec![0, 404]);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("confirmations were not audited");
}
