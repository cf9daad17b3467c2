//! panelgate server
//!
//! Maintenance host for a panel database. `serve` fails tasks orphaned by a
//! previous process, runs the tasks still queued, and sweeps expired
//! confirmations until interrupted. It accepts no requests: a front end
//! embeds `panelgate_server::app::Panel` to log users in, confirm actions,
//! submit tasks and book capacity.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use panelgate_core::config::{Config, DEV_JWT_SECRET, load_config};
use panelgate_core::tracing_init::init_tracing;

use panelgate_server::app::Panel;
use panelgate_server::auth::policy;
use panelgate_server::delivery::LogDelivery;
use panelgate_server::storage::PanelDatabase;
use panelgate_server::tasks::ExecutorRegistry;

#[derive(Parser, Debug)]
#[command(name = "panelgate")]
#[command(version, about = "panelgate - self-service server panel engine")]
struct Args {
    /// Configuration file, merged over the global settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    /// Credential signing secret.
    #[arg(long, env = "PANELGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Number of task workers.
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover queued tasks and sweep expired confirmations until
    /// interrupted (default).
    Serve,
    /// Delete expired confirmation tokens once and exit.
    Sweep,
    /// Check a password read from stdin against the password policy.
    CheckPassword {
        /// Server username the password must not contain.
        #[arg(long)]
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_cli_overrides(&mut config, &args);
    config.validate()?;

    init_tracing(&config.server.log_level, args.log_json)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sweep => {
            let db = open_database(&config).await?;
            let panel = Panel::build(&config, db, Arc::new(LogDelivery), ExecutorRegistry::new());
            let removed = panel.pending.expire_sweep().await?;
            info!(removed, "Sweep finished");
            Ok(())
        }
        Command::CheckPassword { username } => check_password(&username),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting panelgate");
    if config.auth.jwt_secret == DEV_JWT_SECRET {
        warn!("Using the development JWT secret; set PANELGATE_JWT_SECRET in production");
    }

    let db = open_database(&config).await?;
    let executors = ExecutorRegistry::from_config(&config.tasks)?;
    if executors.is_empty() {
        warn!("No task executors configured; confirmed operations will be rejected");
    }

    let panel = Panel::build(&config, db, Arc::new(LogDelivery), executors);
    panel.recover(&config).await?;

    let sweeper =
        panel.spawn_expiry_sweeper(Duration::from_secs(config.confirmation.sweep_interval_secs));

    info!(
        cpu_cores = config.capacity.cpu_cores,
        ram_gb = config.capacity.ram_gb,
        gpu_ram_gb = config.capacity.gpu_ram_gb,
        "panelgate ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    sweeper.abort();

    info!("panelgate stopped");
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(path) = &args.db_path {
        config.server.database_path = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.server.log_level.clone_from(level);
    }
    if let Some(secret) = &args.jwt_secret {
        config.auth.jwt_secret.clone_from(secret);
    }
    if let Some(workers) = args.workers {
        config.tasks.workers = workers;
    }
}

async fn open_database(config: &Config) -> anyhow::Result<PanelDatabase> {
    let path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %path.display(), "Opening panel database");
    Ok(PanelDatabase::open(&path).await?)
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".panelgate").join("panel.db"))
}

#[allow(clippy::print_stdout)]
fn check_password(username: &str) -> anyhow::Result<()> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']);

    match policy::validate(password, username) {
        Ok(()) => {
            println!("ok");
            Ok(())
        }
        Err(violation) => {
            println!("rejected: {violation}");
            println!("suggestion: {}", policy::generate(username));
            anyhow::bail!("password does not satisfy the policy")
        }
    }
}
