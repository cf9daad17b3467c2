//! Configuration resolution for panelgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/panelgate/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`PANELGATE_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are merged key by key, so a file only needs to mention the values it
//! changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Secret shipped in the defaults; refusing it is left to the binary.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

/// Complete panelgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub confirmation: ConfirmationConfig,
    pub tasks: TaskConfig,
    pub capacity: CapacityConfig,
    pub accounts: AccountConfig,
    pub bootstrap: Option<BootstrapAdmin>,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Credential issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Lifetime embedded in signed credentials.
    pub credential_ttl_secs: u64,
    /// Concurrent sessions per user; the oldest is evicted beyond this.
    pub max_sessions: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            credential_ttl_secs: 7 * 24 * 60 * 60, // 7 days
            max_sessions: 5,
        }
    }
}

/// Step-up confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long a confirmation link stays usable.
    pub ttl_secs: u64,
    /// Minimum gap between two confirmation emails to the same user.
    pub email_cooldown_secs: u64,
    /// How often expired pending actions are purged.
    pub sweep_interval_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            email_cooldown_secs: 30,
            sweep_interval_secs: 10 * 60,
        }
    }
}

/// External command bound to a task type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Task engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Number of tasks allowed to execute at once.
    pub workers: usize,
    /// Hard limit on a single task's execution time.
    pub max_runtime_secs: u64,
    /// Executor command per task type name (e.g. `"generate-ssh-key"`).
    pub executors: BTreeMap<String, ExecutorCommand>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_runtime_secs: 600,
            executors: BTreeMap::new(),
        }
    }
}

/// Total bookable resources of the machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapacityConfig {
    pub cpu_cores: i64,
    pub ram_gb: i64,
    pub gpu_ram_gb: i64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            cpu_cores: 32,
            ram_gb: 128,
            gpu_ram_gb: 24,
        }
    }
}

/// Provisioning of server accounts for invited users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountConfig {
    /// Volumes a new user's home directory may be created on.
    pub home_volumes: Vec<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            home_volumes: vec!["/volumes/home".to_string(), "/mnt/home".to_string()],
        }
    }
}

/// Initial administrator created on first start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
    pub name: String,
    pub server_username: String,
}

impl Config {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(Error::Config("auth.jwt_secret must not be empty".into()));
        }
        if self.auth.max_sessions == 0 {
            return Err(Error::Config("auth.max_sessions must be at least 1".into()));
        }
        if self.tasks.workers == 0 {
            return Err(Error::Config("tasks.workers must be at least 1".into()));
        }
        if self.tasks.max_runtime_secs == 0 {
            return Err(Error::Config("tasks.max_runtime_secs must be positive".into()));
        }
        let c = &self.capacity;
        if c.cpu_cores < 0 || c.ram_gb < 0 || c.gpu_ram_gb < 0 {
            return Err(Error::Config("capacity values must not be negative".into()));
        }
        if let Some(bad) = self
            .accounts
            .home_volumes
            .iter()
            .find(|v| !Path::new(v).is_absolute())
        {
            return Err(Error::Config(format!(
                "accounts.home_volumes entries must be absolute paths: {bad:?}"
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("panelgate").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else
/// replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("PANELGATE_DB_PATH") {
        config.server.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("PANELGATE_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("PANELGATE_JWT_SECRET") {
        config.auth.jwt_secret = val;
    }
    if let Some(n) = lookup("PANELGATE_WORKERS").and_then(|v| v.parse().ok()) {
        config.tasks.workers = n;
    }
    if let Some(n) = lookup("PANELGATE_CONFIRMATION_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.confirmation.ttl_secs = n;
    }
    if let Some(n) = lookup("PANELGATE_EMAIL_COOLDOWN_SECS").and_then(|v| v.parse().ok()) {
        config.confirmation.email_cooldown_secs = n;
    }
    if let Some(n) = lookup("PANELGATE_CAPACITY_CPU").and_then(|v| v.parse().ok()) {
        config.capacity.cpu_cores = n;
    }
    if let Some(n) = lookup("PANELGATE_CAPACITY_RAM_GB").and_then(|v| v.parse().ok()) {
        config.capacity.ram_gb = n;
    }
    if let Some(n) = lookup("PANELGATE_CAPACITY_GPU_RAM_GB").and_then(|v| v.parse().ok()) {
        config.capacity.gpu_ram_gb = n;
    }
    if let Some(val) = lookup("PANELGATE_HOME_VOLUMES") {
        config.accounts.home_volumes = val
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
    }

    // The admin is only bootstrapped when all four values are present.
    if let (Some(email), Some(password), Some(name), Some(server_username)) = (
        lookup("PANELGATE_ADMIN_EMAIL"),
        lookup("PANELGATE_ADMIN_PASSWORD"),
        lookup("PANELGATE_ADMIN_NAME"),
        lookup("PANELGATE_ADMIN_SERVER_USERNAME"),
    ) {
        config.bootstrap = Some(BootstrapAdmin {
            email,
            password,
            name,
            server_username,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_has_30_minute_confirmation_window() {
        let config = Config::default();
        assert_eq!(config.confirmation.ttl_secs, 30 * 60);
        assert_eq!(config.confirmation.email_cooldown_secs, 30);
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_values(
            &mut merged,
            serde_json::json!({ "capacity": { "cpu_cores": 16 } }),
        );
        let config: Config = serde_json::from_value(merged).unwrap();
        assert_eq!(config.capacity.cpu_cores, 16);
        assert_eq!(config.capacity.ram_gb, CapacityConfig::default().ram_gb);
        assert_eq!(config.tasks.workers, 4);
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"tasks": {"executors": {"generate-ssh-key": {"program": "/usr/local/bin/keygen"}}}}"#,
        )
        .unwrap();

        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_values(&mut merged, load_config_file(&path).unwrap());
        let config: Config = serde_json::from_value(merged).unwrap();

        let cmd = config.tasks.executors.get("generate-ssh-key").unwrap();
        assert_eq!(cmd.program, PathBuf::from("/usr/local/bin/keygen"));
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_capacity_and_secret() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PANELGATE_CAPACITY_CPU", "16"),
                ("PANELGATE_JWT_SECRET", "s3cret"),
                ("PANELGATE_WORKERS", "not-a-number"),
            ]),
        );
        assert_eq!(config.capacity.cpu_cores, 16);
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.tasks.workers, 4);
    }

    #[test]
    fn bootstrap_requires_all_admin_fields() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PANELGATE_ADMIN_EMAIL", "root@example.com"),
                ("PANELGATE_ADMIN_PASSWORD", "pw"),
            ]),
        );
        assert!(config.bootstrap.is_none());

        apply_env_overrides(
            &mut config,
            env(&[
                ("PANELGATE_ADMIN_EMAIL", "root@example.com"),
                ("PANELGATE_ADMIN_PASSWORD", "pw"),
                ("PANELGATE_ADMIN_NAME", "Admin"),
                ("PANELGATE_ADMIN_SERVER_USERNAME", "admin"),
            ]),
        );
        assert_eq!(config.bootstrap.unwrap().server_username, "admin");
    }

    #[test]
    fn home_volumes_come_from_comma_separated_env() {
        let mut config = Config::default();
        assert_eq!(config.accounts.home_volumes, ["/volumes/home", "/mnt/home"]);

        apply_env_overrides(
            &mut config,
            env(&[("PANELGATE_HOME_VOLUMES", "/data/home, /srv/home ,")]),
        );
        assert_eq!(config.accounts.home_volumes, ["/data/home", "/srv/home"]);
        assert!(config.validate().is_ok());

        config.accounts.home_volumes.push("relative/home".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.tasks.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_capacity_rejected() {
        let mut config = Config::default();
        config.capacity.gpu_ram_gb = -1;
        assert!(config.validate().is_err());
    }
}
