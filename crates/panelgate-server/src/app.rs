//! Wiring of the engine components around one database.

use std::sync::Arc;
use std::time::Duration;

use panelgate_core::config::Config;
use panelgate_core::db::duration_secs;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditSink, DbAuditSink, OperationLogReader};
use crate::auth::{AuthService, JwtManager};
use crate::booking::{BookingAllocator, Resources};
use crate::confirm::ConfirmationService;
use crate::delivery::DeliveryChannel;
use crate::error::Result;
use crate::pending::{PendingActionEngine, PendingConfig};
use crate::storage::PanelDatabase;
use crate::tasks::{ExecutorRegistry, TaskEngine, TaskEngineConfig};
use crate::tokens::TokenRegistry;

/// Every service of a running panel.
#[derive(Clone)]
pub struct Panel {
    pub db: PanelDatabase,
    pub tokens: TokenRegistry,
    pub pending: PendingActionEngine,
    pub tasks: TaskEngine,
    pub bookings: BookingAllocator,
    pub auth: AuthService,
    pub confirmations: ConfirmationService,
    pub audit: Arc<dyn AuditSink>,
    pub logs: OperationLogReader,
}

impl Panel {
    /// Build the services. Starts the task dispatcher, so it must run
    /// within a Tokio runtime.
    pub fn build(
        config: &Config,
        db: PanelDatabase,
        delivery: Arc<dyn DeliveryChannel>,
        executors: ExecutorRegistry,
    ) -> Self {
        let jwt = JwtManager::new(
            config.auth.jwt_secret.as_bytes(),
            duration_secs(Duration::from_secs(config.auth.credential_ttl_secs)),
        );
        let audit: Arc<dyn AuditSink> = Arc::new(DbAuditSink::new(db.clone()));
        let tokens = TokenRegistry::new(db.clone(), config.auth.max_sessions);
        let pending = PendingActionEngine::new(db.clone(), delivery, PendingConfig::from(config))
            .with_audit(Arc::clone(&audit));
        let tasks = TaskEngine::start(db.clone(), executors, TaskEngineConfig::from(&config.tasks))
            .with_audit(Arc::clone(&audit));
        let bookings = BookingAllocator::new(db.clone(), Resources::from(&config.capacity))
            .with_audit(Arc::clone(&audit));

        let auth = AuthService::new(db.clone(), jwt.clone(), tokens.clone(), pending.clone())
            .with_audit(Arc::clone(&audit));
        let confirmations = ConfirmationService::new(
            db.clone(),
            pending.clone(),
            tokens.clone(),
            tasks.clone(),
            jwt,
            Arc::clone(&audit),
        );

        Self {
            logs: OperationLogReader::new(db.clone()),
            db,
            tokens,
            pending,
            tasks,
            bookings,
            auth,
            confirmations,
            audit,
        }
    }

    /// Startup housekeeping: bootstrap the first administrator, fail tasks
    /// interrupted by the previous process and re-queue those never started.
    pub async fn recover(&self, config: &Config) -> Result<()> {
        if let Some(admin) = &config.bootstrap {
            self.auth.bootstrap_admin(admin).await?;
        }
        self.tasks.reconcile_orphaned().await?;
        self.tasks.resume_pending().await?;
        Ok(())
    }

    /// Periodically delete expired pending actions.
    pub fn spawn_expiry_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let pending = self.pending.clone();
        info!(interval_secs = every.as_secs(), "Expiry sweeper started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                if let Err(e) = pending.expire_sweep().await {
                    warn!(error = %e, "Pending action sweep failed");
                }
            }
        })
    }
}
