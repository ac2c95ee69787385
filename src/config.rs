use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::workflow::Profile;
use crate::{clog_debug, Error, Result};

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_SHUTDOWN_RETRIES: u32 = 3;
const DEFAULT_SHUTDOWN_BACKOFF_MS: u64 = 200;
const DEFAULT_GATE_TIMEOUT_SECS: u64 = 15 * 60;

/// Engine configuration, read from `~/.cadre/cadre.toml`.
///
/// Every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// Where checkpoints are written. Defaults to `~/.cadre/checkpoints`.
    pub checkpoint_dir: Option<String>,
    /// Supervisory timeout for tasks whose class has no explicit entry.
    pub default_task_timeout_secs: u64,
    /// Shutdown handshake attempts before a worker is force-closed.
    pub shutdown_retries: u32,
    /// Base backoff between shutdown attempts; doubles on each retry.
    pub shutdown_backoff_ms: u64,
    /// How long a gate waits for a decision.
    pub gate_timeout_secs: u64,
    /// Advisory spend threshold per phase.
    pub cost_warning_threshold: Option<f64>,
    /// Profile used when the CLI does not pass one.
    pub profile: Profile,
    /// Persist the session message log next to the checkpoints.
    pub audit_log: bool,
    /// Shell used by the built-in shell worker.
    pub shell: Option<String>,
    /// Supervisory timeout per task class.
    pub class_timeouts: BTreeMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            checkpoint_dir: None,
            default_task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            shutdown_retries: DEFAULT_SHUTDOWN_RETRIES,
            shutdown_backoff_ms: DEFAULT_SHUTDOWN_BACKOFF_MS,
            gate_timeout_secs: DEFAULT_GATE_TIMEOUT_SECS,
            cost_warning_threshold: None,
            profile: Profile::default(),
            audit_log: true,
            shell: None,
            class_timeouts: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn cadre_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadre"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadre_dir()?.join("cadre.toml"))
    }

    pub fn effective_checkpoint_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadre_dir()?.join("checkpoints")),
        }
    }

    pub fn effective_shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("sh")
    }

    /// Supervisory timeout for a task class.
    pub fn timeout_for(&self, class: Option<&str>) -> Duration {
        let secs = class
            .and_then(|c| self.class_timeouts.get(c))
            .copied()
            .unwrap_or(self.default_task_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn shutdown_backoff(&self) -> Duration {
        Duration::from_millis(self.shutdown_backoff_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Validation(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.shutdown_retries == 0 {
            return Err(Error::Validation(
                "shutdown_retries must be at least 1".to_string(),
            ));
        }
        if let Some(threshold) = self.cost_warning_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(Error::Validation(format!(
                    "cost_warning_threshold must be a non-negative number, got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: max_workers={}, profile={}, checkpoint_dir={:?}",
            config.max_workers,
            config.profile,
            config.checkpoint_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::cadre_dir()?;
        if !dir.exists() {
            clog_debug!("Creating cadre directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
