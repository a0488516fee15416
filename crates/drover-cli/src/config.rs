//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlannerSection {
    pub url: String,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_PLANNER_URL.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: i32,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_attempts() -> i32 {
    3
}

fn default_step_timeout_secs() -> i32 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    // Comfortably above the default step timeout.
    300
}

fn default_health_interval_secs() -> u64 {
    30
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_attempts: default_max_attempts(),
            step_timeout_secs: default_step_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

/// One remote agent endpoint registered at serve startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub name: String,
    pub url: String,
    /// Per-call timeout in seconds; the handle default applies when unset.
    pub timeout_secs: Option<u64>,
}

pub const DEFAULT_PLANNER_URL: &str = "http://localhost:9090";

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub db_config: DbConfig,
    pub planner_url: String,
    pub engine: EngineSection,
    pub agents: Vec<AgentSection>,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `DROVER_DATABASE_URL` > file > default
    /// - Planner URL: `cli_planner_url` > `DROVER_PLANNER_URL` > file > default
    pub fn resolve(cli_db_url: Option<&str>, cli_planner_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("DROVER_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };

        let planner_url = if let Some(url) = cli_planner_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("DROVER_PLANNER_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.planner.url.clone()
        } else {
            DEFAULT_PLANNER_URL.to_owned()
        };

        let (engine, agents) = match file_config {
            Some(cfg) => (cfg.engine, cfg.agents),
            None => (EngineSection::default(), Vec::new()),
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            planner_url,
            engine,
            agents,
        })
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.engine.lock_ttl_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.engine.health_interval_secs)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
