//! Providers of setup commands and run-command arguments

use serde::{Deserialize, Serialize};

use crate::params::OrderedMap;

/// Supplies environment setup for a job.
///
/// Commands are appended to the job's setup commands where the provider is
/// applied. Extra run arguments fill the template's own placeholders and
/// lose to arguments given at assembly time. They cannot override the
/// built-in placeholders (`script_name`, `num_gpus`, `params`,
/// `grid_search_params`, `grid_search_string`, `all_params`), which are always
/// derived from the job so that rendered scripts parse back into it.
pub trait SetupProvider {
    fn commands(&self) -> Vec<String>;

    fn extra_run_args(&self) -> OrderedMap<String>;

    /// Script to run when the job does not name one
    fn script_name(&self) -> String;
}

/// A setup provider with fixed values, typically read from a request file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticSetup {
    pub commands: Vec<String>,
    pub run_args: OrderedMap<String>,
    pub script_name: String,
}

impl StaticSetup {
    pub fn new(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn with_run_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.run_args.insert(key, value.into());
        self
    }
}

impl SetupProvider for StaticSetup {
    fn commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    fn extra_run_args(&self) -> OrderedMap<String> {
        self.run_args.clone()
    }

    fn script_name(&self) -> String {
        self.script_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{JobSpec, RunTemplate};

    #[test]
    fn test_static_setup_feeds_builder() {
        let setup = StaticSetup::new("train.py")
            .with_command("module load python")
            .with_run_arg("checkpoint_dir", "/scratch");
        let spec = JobSpec::builder()
            .command("cd /work")
            .setup(&setup)
            .run_command(RunTemplate::parse("python {script_name} {checkpoint_dir}").unwrap())
            .build()
            .unwrap();

        assert_eq!(spec.script_name(), "train.py");
        assert_eq!(spec.commands(), &["cd /work", "module load python"]);
        assert!(spec.assemble().unwrap().ends_with("python train.py /scratch"));
    }

    #[test]
    fn test_explicit_script_name_wins() {
        let spec = JobSpec::builder()
            .script_name("eval.py")
            .setup(&StaticSetup::new("train.py"))
            .run_command(RunTemplate::parse("python {script_name}").unwrap())
            .build()
            .unwrap();
        assert_eq!(spec.script_name(), "eval.py");
    }
}
