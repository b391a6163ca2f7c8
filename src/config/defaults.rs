//! Default scheduler directives

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::params::{OrderedMap, ParamValue};

/// Environment variable overriding the directory of job logs
pub const LOG_DIR_ENV: &str = "SLURM_OUTPUT_LOG_DIR";

/// Log directory used when neither configuration nor environment sets one
pub const DEFAULT_LOG_DIR: &str = "..";

/// The `[defaults]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Directory for `%j_out.log` / `%j_err.log`; falls back to `SLURM_OUTPUT_LOG_DIR`
    pub log_dir: Option<PathBuf>,

    /// Job name (`-J`)
    pub job_name: String,

    /// Number of nodes (`-N`)
    pub nodes: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            job_name: "run".to_string(),
            nodes: 1,
        }
    }
}

/// Directives every job starts from; a job's own directives override them
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveDefaults {
    job_name: String,
    nodes: u32,
    log_dir: String,
}

impl Default for DirectiveDefaults {
    fn default() -> Self {
        Self {
            job_name: "run".to_string(),
            nodes: 1,
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

impl DirectiveDefaults {
    /// Defaults with the log directory taken from `SLURM_OUTPUT_LOG_DIR`
    pub fn from_env() -> Self {
        Self::from_config(&DefaultsConfig::default())
    }

    /// Defaults from the configuration file; a configured log directory wins
    /// over `SLURM_OUTPUT_LOG_DIR`
    pub fn from_config(config: &DefaultsConfig) -> Self {
        let log_dir = match &config.log_dir {
            Some(dir) => dir.display().to_string(),
            None => env::var(LOG_DIR_ENV).unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()),
        };
        Self {
            job_name: config.job_name.clone(),
            nodes: config.nodes,
            log_dir,
        }
    }

    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }

    pub fn directives(&self) -> OrderedMap<ParamValue> {
        let mut directives = OrderedMap::new();
        directives.insert("-J", ParamValue::from(self.job_name.as_str()));
        directives.insert("-N", ParamValue::from(self.nodes as i64));
        directives.insert("-o", ParamValue::Str(format!("{}/%j_out.log", self.log_dir)));
        directives.insert("-e", ParamValue::Str(format!("{}/%j_err.log", self.log_dir)));
        directives
    }
}
