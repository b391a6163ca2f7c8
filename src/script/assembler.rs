//! Rendering of job specifications into sbatch scripts
//!
//! The layout is fixed so that [`super::parser::ScriptParser`] can read it
//! back:
//!
//! ```text
//! #!/bin/sh
//! #SBATCH --key=value
//! #SBATCH -k value
//!
//! <setup commands>
//! <var>_param=("v1" "v2")        (or <var>_param=v for a pinned task)
//! taskId=...                    (or a `for taskId in $(seq 0 N-1)` loop)
//! <run command>
//! done                          (loop only)
//! <post commands>
//! ```

use log::{debug, warn};

use super::job_spec::JobSpec;
use super::template::{Placeholder, Substitutions};
use crate::errors::{Result, ScriptError};
use crate::params::{OrderedMap, ParamValue, param_variable};

pub const SHEBANG: &str = "#!/bin/sh";
pub const DIRECTIVE_MARKER: &str = "#SBATCH";
/// Shell variable holding the current task index
pub const TASK_ID_VAR: &str = "taskId";
/// Environment variable Slurm sets for each array task
pub const ARRAY_TASK_ENV: &str = "$SLURM_ARRAY_TASK_ID";
pub const LOOP_OPEN: &str = "do";
pub const LOOP_CLOSE: &str = "done";

/// How the task index is bound in the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Slurm job array; the scheduler provides the index
    NativeArray,
    /// A single, explicitly requested task
    Pinned(usize),
    /// All tasks run one after another in a shell loop
    Loop(usize),
    /// Only one task exists
    Single,
}

impl TaskMode {
    fn resolve(spec: &JobSpec, task_id: Option<usize>) -> TaskMode {
        if spec.has_native_array() {
            TaskMode::NativeArray
        } else if let Some(task_id) = task_id {
            TaskMode::Pinned(task_id)
        } else if spec.n_jobs() > 1 {
            TaskMode::Loop(spec.n_jobs())
        } else {
            TaskMode::Single
        }
    }

    /// Whether grid parameters are declared as full per-task arrays
    fn declares_arrays(self) -> bool {
        matches!(self, TaskMode::NativeArray | TaskMode::Loop(_))
    }

    fn task_id_lines(self) -> Vec<String> {
        match self {
            TaskMode::NativeArray => vec![format!("{}={}", TASK_ID_VAR, ARRAY_TASK_ENV)],
            TaskMode::Pinned(task_id) => vec![format!("{}={}", TASK_ID_VAR, task_id)],
            TaskMode::Loop(n_jobs) => vec![
                format!("for {} in $(seq 0 {})", TASK_ID_VAR, n_jobs - 1),
                LOOP_OPEN.to_string(),
            ],
            TaskMode::Single => vec![format!("{}=0", TASK_ID_VAR)],
        }
    }
}

/// Renders one script from a [`JobSpec`]
pub struct ScriptAssembler<'a> {
    spec: &'a JobSpec,
    task_id: Option<usize>,
    extra_args: OrderedMap<String>,
}

impl<'a> ScriptAssembler<'a> {
    pub fn new(spec: &'a JobSpec) -> Self {
        Self {
            spec,
            task_id: spec.task_id(),
            extra_args: OrderedMap::new(),
        }
    }

    /// Render a single task instead of the spec's own task id
    pub fn with_task_id(mut self, task_id: Option<usize>) -> Self {
        self.task_id = task_id;
        self
    }

    /// Extra template substitutions; these win over the spec's own run args
    pub fn with_args(mut self, args: &OrderedMap<String>) -> Self {
        for (key, value) in args.iter() {
            self.extra_args.insert(key, value.clone());
        }
        self
    }

    pub fn task_mode(&self) -> TaskMode {
        TaskMode::resolve(self.spec, self.task_id)
    }

    pub fn assemble(&self) -> Result<String> {
        let spec = self.spec;
        if let Some(task_id) = self.task_id
            && task_id >= spec.n_jobs()
        {
            return Err(ScriptError::validation(format!(
                "task id {} is out of range; it should be >= 0 and < {}",
                task_id,
                spec.n_jobs()
            )));
        }
        let mode = self.task_mode();
        debug!("Assembling '{}' in {:?} mode", spec.script_name(), mode);

        let mut lines = vec![SHEBANG.to_string()];
        lines.extend(self.directive_lines());
        lines.push(String::new());
        lines.extend(spec.commands().iter().cloned());
        lines.extend(self.declaration_lines(mode));
        lines.extend(mode.task_id_lines());
        lines.push(self.run_command(mode)?);
        if matches!(mode, TaskMode::Loop(_)) {
            lines.push(LOOP_CLOSE.to_string());
        }
        lines.extend(spec.post_commands().iter().cloned());

        Ok(lines.join("\n"))
    }

    fn directive_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (key, value) in self.spec.directives().iter() {
            if key.starts_with("--") {
                lines.push(format!("{} {}={}", DIRECTIVE_MARKER, key, value));
            } else if key.starts_with('-') {
                lines.push(format!("{} {} {}", DIRECTIVE_MARKER, key, value));
            } else {
                warn!(
                    "Skipping directive '{}': sbatch options must start with '-' or '--'",
                    key
                );
            }
        }
        lines
    }

    fn declaration_lines(&self, mode: TaskMode) -> Vec<String> {
        let mut lines = Vec::new();
        for path in self.spec.grid_paths() {
            let Some(ParamValue::List(per_task)) = self.spec.params().get(path) else {
                continue;
            };
            let variable = param_variable(path);
            if mode.declares_arrays() {
                let elements: Vec<String> = per_task
                    .iter()
                    .map(|value| format!("\"{}\"", escape_value(value)))
                    .collect();
                lines.push(format!("{}=({})", variable, elements.join(" ")));
            } else {
                let index = self.task_id.unwrap_or(0);
                lines.push(format!("{}={}", variable, escape_value(&per_task[index])));
            }
        }
        lines
    }

    fn run_command(&self, mode: TaskMode) -> Result<String> {
        let spec = self.spec;
        let index = if mode.declares_arrays() {
            format!("[${}]", TASK_ID_VAR)
        } else {
            String::new()
        };

        let mut params = Vec::new();
        let mut grid_params = Vec::new();
        let mut grid_refs = Vec::new();
        let mut all_params = Vec::new();
        for (path, value) in spec.params().iter() {
            if spec.is_grid_path(path) {
                let reference = format!("{}=${{{}{}}}", path, param_variable(path), index);
                let token = format!("\"{}\"", reference);
                grid_params.push(token.clone());
                all_params.push(token);
                grid_refs.push(reference);
            } else {
                let token = format!("\"{}={}\"", path, escape_value(value));
                params.push(token.clone());
                all_params.push(token);
            }
        }

        let mut extra = spec.run_args().clone();
        for (key, value) in self.extra_args.iter() {
            extra.insert(key, value.clone());
        }
        for key in extra.keys() {
            if Placeholder::from_name(key).is_builtin() {
                warn!("Ignoring run argument '{}': it is a built-in placeholder", key);
            }
        }

        let substitutions = Substitutions {
            script_name: spec.script_name().to_string(),
            num_gpus: spec.num_gpus(),
            params: params.join(" "),
            grid_search_params: grid_params.join(" "),
            grid_search_string: grid_refs.join("_"),
            all_params: all_params.join(" "),
            extra,
        };
        spec.template().render(&substitutions)
    }
}

/// Stringify a value for the script, escaping double quotes
pub fn escape_value(value: &ParamValue) -> String {
    value.to_string().replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ConfigTree, GridSearch};
    use crate::script::template::RunTemplate;
    use serde_json::json;

    fn grid_spec(directives: &[(&str, &str)]) -> JobSpec {
        let mut builder = JobSpec::builder()
            .directive("-J", "sweep")
            .params(
                ConfigTree::from_json(&json!({
                    "seed": 0,
                    "optim": {"lr": [0.1, 0.01]},
                    "model": {"act": ["relu", "gelu"]},
                }))
                .unwrap(),
            )
            .grid_search(GridSearch::new(["optim.lr", "model.act"], vec![]))
            .script_name("train.py")
            .run_command(RunTemplate::parse("python {script_name} {all_params}").unwrap());
        for (key, value) in directives {
            builder = builder.directive(*key, *value);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_simple_script_layout() {
        let spec = JobSpec::builder()
            .directive("-J", "job-name")
            .directive("-N", 1)
            .directive("--time", "01:00:00")
            .params(ConfigTree::from_json(&json!({"script_param": 7})).unwrap())
            .script_name("main.py")
            .run_command(RunTemplate::parse("python {script_name} {all_params}").unwrap())
            .build()
            .unwrap();

        assert_eq!(
            spec.assemble().unwrap(),
            "#!/bin/sh\n\
             #SBATCH -J job-name\n\
             #SBATCH -N 1\n\
             #SBATCH --time=01:00:00\n\
             \n\
             taskId=0\n\
             python main.py \"script_param=7\""
        );
    }

    #[test]
    fn test_loop_mode() {
        let script = grid_spec(&[]).assemble().unwrap();
        assert_eq!(
            script,
            "#!/bin/sh\n\
             #SBATCH -J sweep\n\
             \n\
             optimlr_param=(\"0.1\" \"0.1\" \"0.01\" \"0.01\")\n\
             modelact_param=(\"relu\" \"gelu\" \"relu\" \"gelu\")\n\
             for taskId in $(seq 0 3)\n\
             do\n\
             python train.py \"seed=0\" \"optim.lr=${optimlr_param[$taskId]}\" \"model.act=${modelact_param[$taskId]}\"\n\
             done"
        );
    }

    #[test]
    fn test_native_array_mode() {
        let spec = grid_spec(&[("--array", "auto")]);
        let script = spec.assemble().unwrap();
        assert!(script.contains("#SBATCH --array=0-3\n"));
        assert!(script.contains("taskId=$SLURM_ARRAY_TASK_ID\n"));
        assert!(script.contains("optimlr_param=(\"0.1\" \"0.1\" \"0.01\" \"0.01\")"));
        assert!(!script.contains("for taskId"));
        assert!(!script.contains("done"));
    }

    #[test]
    fn test_pinned_task_mode() {
        let spec = grid_spec(&[]);
        let script = ScriptAssembler::new(&spec)
            .with_task_id(Some(3))
            .assemble()
            .unwrap();
        assert!(script.contains("\noptimlr_param=0.01\n"));
        assert!(script.contains("\nmodelact_param=gelu\n"));
        assert!(script.contains("\ntaskId=3\n"));
        assert!(script.contains("\"optim.lr=${optimlr_param}\""));
        assert!(!script.contains("for taskId"));
    }

    #[test]
    fn test_pinned_task_out_of_range() {
        let spec = grid_spec(&[]);
        let result = ScriptAssembler::new(&spec).with_task_id(Some(4)).assemble();
        assert!(matches!(result, Err(ScriptError::Validation(_))));
    }

    #[test]
    fn test_grid_placeholders() {
        let spec = JobSpec::builder()
            .params(ConfigTree::from_json(&json!({"a": [1, 2], "b": "x"})).unwrap())
            .grid_search(GridSearch::new(["a"], vec![]))
            .script_name("main.py")
            .run_command(
                RunTemplate::parse(
                    "python {script_name} {params} {grid_search_params} --tag run{grid_search_string}",
                )
                .unwrap(),
            )
            .build()
            .unwrap();
        let script = spec.assemble().unwrap();
        assert!(script.contains(
            "python main.py \"b=x\" \"a=${a_param[$taskId]}\" --tag runa=${a_param[$taskId]}"
        ));
    }

    #[test]
    fn test_values_are_escaped() {
        let spec = JobSpec::builder()
            .params(
                ConfigTree::from_json(&json!({"msg": [null, "say \"hi\""], "name": "a\"b"}))
                    .unwrap(),
            )
            .grid_search(GridSearch::new(["msg"], vec![]))
            .script_name("main.py")
            .run_command(RunTemplate::parse("python {script_name} {all_params}").unwrap())
            .build()
            .unwrap();
        let script = spec.assemble().unwrap();
        assert!(script.contains("msg_param=(\"null\" \"say \\\"hi\\\"\")"));
        assert!(script.contains("\"name=a\\\"b\""));
    }

    #[test]
    fn test_extra_args_and_post_commands() {
        let spec = JobSpec::builder()
            .command("module load python")
            .post_command("echo finished")
            .run_arg("checkpoint_dir", "/scratch/ckpt")
            .script_name("main.py")
            .run_command(
                RunTemplate::parse("python {script_name} ckpt={checkpoint_dir} gpus={num_gpus}")
                    .unwrap(),
            )
            .directive("--gres", "gpu:2")
            .build()
            .unwrap();

        let overrides: OrderedMap<String> =
            [("checkpoint_dir", "/other".to_string())].into_iter().collect();
        let script = ScriptAssembler::new(&spec)
            .with_args(&overrides)
            .assemble()
            .unwrap();
        assert!(script.ends_with(
            "module load python\ntaskId=0\npython main.py ckpt=/other gpus=2\necho finished"
        ));
    }

    #[test]
    fn test_run_args_cannot_replace_builtins() {
        let spec = JobSpec::builder()
            .params(ConfigTree::from_json(&json!({"seed": 1})).unwrap())
            .run_arg("script_name", "other.py")
            .script_name("main.py")
            .run_command(RunTemplate::parse("python {script_name} {params}").unwrap())
            .build()
            .unwrap();
        let overrides: OrderedMap<String> =
            [("params", "--fast".to_string())].into_iter().collect();
        let script = ScriptAssembler::new(&spec)
            .with_args(&overrides)
            .assemble()
            .unwrap();
        assert!(script.ends_with("python main.py \"seed=1\""));
    }

    #[test]
    fn test_unfilled_placeholder_fails() {
        let spec = JobSpec::builder()
            .script_name("main.py")
            .run_command(RunTemplate::parse("python {script_name} {missing}").unwrap())
            .build()
            .unwrap();
        assert!(matches!(spec.assemble(), Err(ScriptError::Template(_))));
    }

    #[test]
    fn test_directives_without_dash_are_skipped() {
        let spec = JobSpec::builder()
            .directive("partition", "debug")
            .script_name("main.py")
            .run_command(RunTemplate::parse("python {script_name}").unwrap())
            .build()
            .unwrap();
        assert!(!spec.assemble().unwrap().contains("partition"));
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let spec = grid_spec(&[("--array", "auto")]);
        assert_eq!(spec.assemble().unwrap(), spec.assemble().unwrap());
    }
}
