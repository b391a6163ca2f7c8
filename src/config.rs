//! Configuration management for autobatch
//!
//! Settings are read from TOML files in increasing priority:
//!
//! 1. `/etc/autobatch/config.toml`
//! 2. `<user config dir>/autobatch/config.toml`
//! 3. `autobatch.toml` in the working directory
//!
//! Later files override earlier ones key by key; missing files are skipped.
//! Command-line flags override everything.

pub mod defaults;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use defaults::{DefaultsConfig, DirectiveDefaults};

const VALID_LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutobatchConfig {
    /// Log level (off, error, warn, info, debug, trace)
    pub log_level: Option<String>,

    /// Scheduler submission executable; `sbatch` when unset
    pub sbatch_exec: Option<String>,

    /// Default directives
    pub defaults: DefaultsConfig,

    /// Submission behaviour
    pub submit: SubmitConfig,
}

/// The `[submit]` section of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// Directory where generated scripts are saved before submission
    pub save_dir: Option<PathBuf>,

    /// Submit one pinned script per task instead of a loop script
    pub schedule_all_tasks: bool,

    /// Render and save scripts without submitting them
    pub dry_run: bool,
}

/// Locations searched for configuration files
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: Option<PathBuf>,
    pub local: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPaths {
    pub fn new() -> Self {
        Self {
            system: PathBuf::from("/etc/autobatch/config.toml"),
            user: dirs::config_dir().map(|dir| dir.join("autobatch").join("config.toml")),
            local: PathBuf::from("autobatch.toml"),
        }
    }

    /// All candidate paths in priority order, lowest first
    pub fn all_paths(&self) -> Vec<&PathBuf> {
        let mut paths = vec![&self.system];
        if let Some(user) = &self.user {
            paths.push(user);
        }
        paths.push(&self.local);
        paths
    }

    /// Candidate paths that exist, lowest priority first
    pub fn existing_paths(&self) -> Vec<&PathBuf> {
        self.all_paths()
            .into_iter()
            .filter(|path| path.exists())
            .collect()
    }

    pub fn user_config_dir(&self) -> Option<&Path> {
        self.user.as_deref().and_then(Path::parent)
    }
}

impl AutobatchConfig {
    /// Load from the standard locations
    pub fn load() -> Result<Self> {
        Self::load_with_paths(&ConfigPaths::new())
    }

    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self> {
        let existing: Vec<PathBuf> = paths.existing_paths().into_iter().cloned().collect();
        Self::load_from_files(&existing)
    }

    /// Load and merge the given files in order; later files win
    pub fn load_from_files(files: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in files {
            if !path.exists() {
                debug!("Config file {:?} does not exist, skipping", path);
                continue;
            }
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {:?}", path))?;
            debug!("Loaded config file {:?}", path);
            merge_tables(&mut merged, table);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")
    }

    /// Check every field, collecting all problems
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Some(level) = &self.log_level
            && !VALID_LOG_LEVELS.contains(&level.to_lowercase().as_str())
        {
            errors.push(format!(
                "log_level must be one of {:?}, got '{}'",
                VALID_LOG_LEVELS, level
            ));
        }
        if let Some(exec) = &self.sbatch_exec
            && exec.trim().is_empty()
        {
            errors.push("sbatch_exec must not be empty".to_string());
        }
        if self.defaults.job_name.trim().is_empty() {
            errors.push("defaults.job_name must not be empty".to_string());
        }
        if self.defaults.nodes == 0 {
            errors.push("defaults.nodes must be at least 1".to_string());
        }
        if let Some(dir) = &self.submit.save_dir
            && dir.exists()
            && !dir.is_dir()
        {
            errors.push(format!("submit.save_dir {:?} is not a directory", dir));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// A commented configuration file with every default spelled out
    pub fn generate_default_config() -> String {
        r#"# autobatch configuration
#
# Files are read in this order, later ones overriding earlier ones:
#   /etc/autobatch/config.toml
#   ~/.config/autobatch/config.toml
#   ./autobatch.toml

# Log level: off, error, warn, info, debug, trace
# log_level = "info"

# Executable used to submit scripts
# sbatch_exec = "sbatch"

[defaults]
# Directory of job logs; SLURM_OUTPUT_LOG_DIR or ".." when unset
# log_dir = "/scratch/logs"
job_name = "run"
nodes = 1

[submit]
# Directory where scripts are saved before submission
# save_dir = "scripts"
schedule_all_tasks = false
dry_run = false
"#
        .to_string()
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
