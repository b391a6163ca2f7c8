//! Job specifications
//!
//! A [`JobSpec`] is everything needed to render a batch script: scheduler
//! directives, flattened parameters (already expanded for grid search),
//! setup and post commands, and the run-command template. It is built once
//! through [`JobSpecBuilder`] and never mutated afterwards.

use log::{debug, info};
use std::collections::HashMap;

use super::template::RunTemplate;
use crate::config::defaults::DirectiveDefaults;
use crate::errors::{Result, ScriptError};
use crate::hpc::SetupProvider;
use crate::params::{
    ConfigTree, ExclusionRule, FlatParams, GridSearch, OrderedMap, ParamValue, flatten,
    param_variable,
};

/// Directive that turns the script into a native Slurm job array
pub const ARRAY_DIRECTIVE: &str = "--array";
/// Directive carrying generic resources such as `gpu:4`
pub const GRES_DIRECTIVE: &str = "--gres";
/// `--array` value asking for one array task per grid-search combination
pub const ARRAY_AUTO: &str = "auto";

/// An immutable, fully expanded job specification
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    directives: OrderedMap<ParamValue>,
    params: FlatParams,
    grid_paths: Vec<String>,
    exclude: Vec<ExclusionRule>,
    commands: Vec<String>,
    post_commands: Vec<String>,
    template: RunTemplate,
    script_name: String,
    task_id: Option<usize>,
    n_jobs: usize,
    run_args: OrderedMap<String>,
}

impl JobSpec {
    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::new()
    }

    pub fn directives(&self) -> &OrderedMap<ParamValue> {
        &self.directives
    }

    /// Flattened parameters; grid-searched paths hold per-task lists
    pub fn params(&self) -> &FlatParams {
        &self.params
    }

    /// Grid-searched paths in flattened order
    pub fn grid_paths(&self) -> &[String] {
        &self.grid_paths
    }

    pub fn is_grid_path(&self, path: &str) -> bool {
        self.grid_paths.iter().any(|p| p == path)
    }

    pub fn exclude(&self) -> &[ExclusionRule] {
        &self.exclude
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn post_commands(&self) -> &[String] {
        &self.post_commands
    }

    pub fn template(&self) -> &RunTemplate {
        &self.template
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn task_id(&self) -> Option<usize> {
        self.task_id
    }

    /// Number of grid-search combinations (1 without grid search)
    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    /// Extra template substitutions
    pub fn run_args(&self) -> &OrderedMap<String> {
        &self.run_args
    }

    pub fn has_native_array(&self) -> bool {
        self.directives.contains_key(ARRAY_DIRECTIVE)
    }

    /// GPU count from a `--gres=<resource>:<count>` directive, 0 if absent or malformed
    pub fn num_gpus(&self) -> u32 {
        let Some(gres) = self.directives.get(GRES_DIRECTIVE) else {
            return 0;
        };
        let gres = gres.to_string();
        let fields: Vec<&str> = gres.split(':').collect();
        if fields.len() < 2 {
            return 0;
        }
        fields
            .last()
            .and_then(|count| count.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    /// Values of one grid-search combination
    pub fn task_params(&self, task_id: usize) -> Result<OrderedMap<ParamValue>> {
        if task_id >= self.n_jobs {
            return Err(ScriptError::validation(format!(
                "task id {} is out of range; it should be >= 0 and < {}",
                task_id, self.n_jobs
            )));
        }
        let mut values = OrderedMap::new();
        for path in &self.grid_paths {
            if let Some(ParamValue::List(per_task)) = self.params.get(path) {
                values.insert(path.clone(), per_task[task_id].clone());
            }
        }
        Ok(values)
    }

    /// Render the script for this spec's own task id
    pub fn assemble(&self) -> Result<String> {
        super::assembler::ScriptAssembler::new(self).assemble()
    }
}

/// Builder for [`JobSpec`]
#[derive(Debug, Clone, Default)]
pub struct JobSpecBuilder {
    defaults: OrderedMap<ParamValue>,
    directives: OrderedMap<ParamValue>,
    config: ConfigTree,
    grid_search: Option<GridSearch>,
    commands: Vec<String>,
    post_commands: Vec<String>,
    template: Option<RunTemplate>,
    script_name: Option<String>,
    task_id: Option<usize>,
    run_args: OrderedMap<String>,
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directives applied before (and overridden by) the user's directives
    pub fn with_defaults(mut self, defaults: &DirectiveDefaults) -> Self {
        self.defaults = defaults.directives();
        self
    }

    pub fn directive(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.directives.insert(key, value.into());
        self
    }

    pub fn directives(mut self, directives: OrderedMap<ParamValue>) -> Self {
        for (key, value) in directives {
            self.directives.insert(key, value);
        }
        self
    }

    /// Nested script parameters, deep-merged into any already set
    pub fn params(mut self, params: ConfigTree) -> Self {
        self.config.merge(params);
        self
    }

    pub fn grid_search(mut self, grid_search: GridSearch) -> Self {
        self.grid_search = Some(grid_search);
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn post_command(mut self, command: impl Into<String>) -> Self {
        self.post_commands.push(command.into());
        self
    }

    pub fn post_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post_commands
            .extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn run_command(mut self, template: RunTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    pub fn task_id(mut self, task_id: Option<usize>) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn run_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.run_args.insert(key, value.into());
        self
    }

    /// Take setup commands, extra run arguments and the script name from a provider.
    ///
    /// An explicit script name set on the builder takes precedence.
    pub fn setup(mut self, provider: &dyn SetupProvider) -> Self {
        self.commands.extend(provider.commands());
        for (key, value) in provider.extra_run_args() {
            self.run_args.insert(key, value);
        }
        if self.script_name.is_none() {
            self.script_name = Some(provider.script_name());
        }
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        let mut directives = self.defaults;
        for (key, value) in self.directives {
            directives.insert(key, value);
        }

        let script_name = self.script_name.ok_or_else(|| {
            ScriptError::configuration(
                "no script name: set one explicitly or configure a setup provider",
            )
        })?;
        let template = self
            .template
            .ok_or_else(|| ScriptError::configuration("no run command template was given"))?;

        let mut params = flatten(&self.config)?;
        let mut grid_paths = Vec::new();
        let mut exclude = Vec::new();
        let mut n_jobs = 1;
        let grid_search = self.grid_search.filter(|grid| !grid.is_empty());
        if let Some(grid) = &grid_search {
            let expansion = grid.expand(&params)?;
            n_jobs = expansion.n_jobs;
            grid_paths = expansion.paths;
            params = expansion.expanded;
            exclude = grid.exclude().to_vec();
            check_grid_variables(&grid_paths)?;
        }

        let array_auto = directives
            .get(ARRAY_DIRECTIVE)
            .and_then(ParamValue::as_str)
            .is_some_and(|value| value == ARRAY_AUTO);
        if array_auto {
            if grid_search.is_none() {
                return Err(ScriptError::configuration(
                    "cannot use --array=auto when no grid search is set",
                ));
            }
            if n_jobs == 1 {
                directives.remove(ARRAY_DIRECTIVE);
            } else {
                directives.insert(ARRAY_DIRECTIVE, ParamValue::Str(format!("0-{}", n_jobs - 1)));
            }
        }

        if let Some(task_id) = self.task_id
            && task_id >= n_jobs
        {
            return Err(ScriptError::validation(format!(
                "task id {} is out of range; it should be >= 0 and < {}",
                task_id, n_jobs
            )));
        }

        if n_jobs > 1 {
            info!("Grid search expands to {} tasks", n_jobs);
        }
        debug!(
            "Built job spec for '{}' with {} directive(s) and {} parameter(s)",
            script_name,
            directives.len(),
            params.len()
        );

        Ok(JobSpec {
            directives,
            params,
            grid_paths,
            exclude,
            commands: self.commands,
            post_commands: self.post_commands,
            template,
            script_name,
            task_id: self.task_id,
            n_jobs,
            run_args: self.run_args,
        })
    }
}

/// Reject grid paths whose shell variables are not valid identifiers or
/// would overwrite each other
fn check_grid_variables(grid_paths: &[String]) -> Result<()> {
    let mut by_variable: HashMap<String, &str> = HashMap::new();
    for path in grid_paths {
        let variable = param_variable(path);
        if !is_shell_identifier(&variable) {
            return Err(ScriptError::validation(format!(
                "grid-search parameter '{}' gives shell variable '{}'; \
                 paths may only contain letters, digits, '_', '.' and '/' \
                 and must not start with a digit",
                path, variable
            )));
        }
        if let Some(first) = by_variable.get(&variable) {
            return Err(ScriptError::VariableCollision {
                first: first.to_string(),
                second: path.clone(),
                variable,
            });
        }
        by_variable.insert(variable, path);
    }
    Ok(())
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
