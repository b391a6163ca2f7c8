//! Job request files
//!
//! A request describes one job the way a user writes it: directives, nested
//! parameters, an optional grid search and the run command. Requests can be
//! written as JSON, JSON5, YAML or TOML; every format is first read into a
//! `serde_json::Value` so they all behave the same.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::DirectiveDefaults;
use crate::errors::{Result, ScriptError};
use crate::hpc::StaticSetup;
use crate::params::{
    ConfigTree, ExclusionRule, FlatParams, GridMode, GridSearch, OrderedMap, ParamValue,
    unflatten,
};
use crate::script::{JobSpecBuilder, RunTemplate};

/// Grid-search section of a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearchRequest {
    /// Dotted paths of list parameters to search over
    pub paths: Vec<String>,
    /// Partial combinations to leave out
    pub exclude: Vec<ExclusionRule>,
    pub mode: GridMode,
}

/// A job as described in a request file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    /// Scheduler directives such as `--time` or `-N`
    pub directives: OrderedMap<ParamValue>,
    /// Nested script parameters
    pub params: ConfigTree,
    pub grid_search: Option<GridSearchRequest>,
    /// Setup commands run before the job
    pub commands: Vec<String>,
    /// Commands run after the job
    pub post_commands: Vec<String>,
    pub run_command: Option<RunTemplate>,
    pub script_name: Option<String>,
    /// Render only this task
    pub task_id: Option<usize>,
    /// Values for extra run-command placeholders
    pub run_args: OrderedMap<String>,
    /// Setup provider contents
    pub setup: Option<StaticSetup>,
}

impl JobRequest {
    /// Load a request, picking the format from the file extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<JobRequest> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        debug!("Loading job request from {:?}", path);
        Self::from_str_with_format(&content, extension)
    }

    /// Parse request content; an unknown format tries each parser in turn
    pub fn from_str_with_format(content: &str, format: &str) -> Result<JobRequest> {
        let value: serde_json::Value = match format.to_lowercase().as_str() {
            "json" => serde_json::from_str(content).map_err(request_error)?,
            "json5" => json5::from_str(content).map_err(request_error)?,
            "yaml" | "yml" => serde_yaml::from_str(content).map_err(request_error)?,
            "toml" => toml::from_str(content).map_err(request_error)?,
            _ => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                    value
                } else if let Ok(value) = json5::from_str::<serde_json::Value>(content) {
                    value
                } else if let Ok(value) = toml::from_str::<serde_json::Value>(content) {
                    value
                } else {
                    serde_yaml::from_str(content).map_err(|e| {
                        ScriptError::request(format!(
                            "unable to parse the request as JSON, JSON5, TOML or YAML: {}",
                            e
                        ))
                    })?
                }
            }
        };
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<JobRequest> {
        serde_json::from_value(value).map_err(request_error)
    }

    /// Apply `dotted.path=value` overrides to the parameters.
    ///
    /// Values are read as JSON literals where possible, so `lr=0.1` sets a
    /// number and `layers=[1,2]` a list.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<()> {
        let mut flat = FlatParams::new();
        for item in overrides {
            let item = item.as_ref();
            let Some((path, value)) = item.split_once('=') else {
                return Err(ScriptError::request(format!(
                    "override '{}' must look like path=value",
                    item
                )));
            };
            let path = path.trim();
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(ScriptError::request(format!(
                    "override '{}' has an invalid path",
                    item
                )));
            }
            flat.insert(path, ParamValue::decode_literal(value.trim()));
        }
        if !flat.is_empty() {
            debug!("Applying {} parameter override(s)", flat.len());
            self.params.merge(unflatten(&flat));
        }
        Ok(())
    }

    /// Builder for this request, starting from `defaults`
    pub fn builder(&self, defaults: &DirectiveDefaults) -> JobSpecBuilder {
        let mut builder = JobSpecBuilder::new()
            .with_defaults(defaults)
            .directives(self.directives.clone())
            .params(self.params.clone())
            .commands(self.commands.iter().cloned())
            .post_commands(self.post_commands.iter().cloned())
            .task_id(self.task_id);
        if let Some(grid) = &self.grid_search {
            builder = builder.grid_search(
                GridSearch::new(grid.paths.iter().cloned(), grid.exclude.clone())
                    .with_mode(grid.mode),
            );
        }
        if let Some(template) = &self.run_command {
            builder = builder.run_command(template.clone());
        }
        if let Some(name) = &self.script_name {
            builder = builder.script_name(name.clone());
        }
        if let Some(setup) = &self.setup {
            builder = builder.setup(setup);
        }
        for (key, value) in self.run_args.iter() {
            builder = builder.run_arg(key, value.clone());
        }
        builder
    }
}

fn request_error(error: impl std::fmt::Display) -> ScriptError {
    ScriptError::request(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_request() {
        let request = JobRequest::from_str_with_format(
            r#"{"script_name": "main.py", "run_command": "python {script_name} {all_params}"}"#,
            "json",
        )
        .unwrap();
        assert_eq!(request.script_name.as_deref(), Some("main.py"));
        assert!(request.params.is_empty());
        assert!(request.grid_search.is_none());
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        let result =
            JobRequest::from_str_with_format(r#"{"run_command": "python {0}"}"#, "json");
        assert!(matches!(result, Err(ScriptError::Request(_))));
    }

    #[test]
    fn test_overrides_replace_nested_values() {
        let mut request = JobRequest::from_str_with_format(
            r#"{"params": {"optim": {"lr": 0.1, "momentum": 0.9}, "seed": 1}}"#,
            "json",
        )
        .unwrap();
        request
            .apply_overrides(&["optim.lr=0.01", "model.layers=[64,64]"])
            .unwrap();

        let flat = crate::params::flatten(&request.params).unwrap();
        let keys: Vec<&str> = flat.keys().collect();
        assert_eq!(keys, vec!["optim.lr", "optim.momentum", "seed", "model.layers"]);
        assert_eq!(flat.get("optim.lr"), Some(&ParamValue::Float(0.01)));
        assert_eq!(
            flat.get("model.layers"),
            Some(&ParamValue::from(vec![64, 64]))
        );
    }

    #[test]
    fn test_malformed_overrides() {
        let mut request = JobRequest::default();
        assert!(request.apply_overrides(&["no-equals"]).is_err());
        assert!(request.apply_overrides(&["a..b=1"]).is_err());
        assert!(request.apply_overrides(&["=1"]).is_err());
    }
}
