//! End-to-end tests for rendering and parsing batch scripts

use autobatch::ScriptError;
use autobatch::config::DirectiveDefaults;
use autobatch::params::{ConfigTree, GridSearch, ParamValue};
use autobatch::script::{JobSpec, RunTemplate, ScriptAssembler, ScriptParser, TaskMode};
use rstest::{fixture, rstest};
use serde_json::json;

const TEMPLATE: &str = "python {script_name} {all_params} --gpus {num_gpus}";

fn template() -> RunTemplate {
    RunTemplate::parse(TEMPLATE).unwrap()
}

/// Two grid-searched paths and two plain parameters
#[fixture]
fn sweep_params() -> ConfigTree {
    ConfigTree::from_json(&json!({
        "seed": 0,
        "optim": {"lr": [0.1, 0.01], "name": "adam"},
        "model": {"act": ["relu", "gelu"]},
    }))
    .unwrap()
}

fn sweep_spec(params: ConfigTree, native_array: bool) -> JobSpec {
    let mut builder = JobSpec::builder()
        .directive("-J", "sweep")
        .directive("--time", "01:00:00")
        .directive("--gres", "gpu:2")
        .params(params)
        .grid_search(GridSearch::new(["optim.lr", "model.act"], vec![]))
        .command("module load python")
        .command("cd /work")
        .post_command("echo finished")
        .script_name("train.py")
        .run_command(template());
    if native_array {
        builder = builder.directive("--array", "auto");
    }
    builder.build().unwrap()
}

fn reassemble(script: &str) -> String {
    let parsed = ScriptParser::new(&template()).unwrap().parse(script).unwrap();
    parsed
        .into_builder(template())
        .build()
        .unwrap()
        .assemble()
        .unwrap()
}

#[rstest]
#[case::native_array(true)]
#[case::loop_mode(false)]
fn test_round_trip_is_byte_identical(sweep_params: ConfigTree, #[case] native_array: bool) {
    let script = sweep_spec(sweep_params, native_array).assemble().unwrap();
    assert_eq!(reassemble(&script), script);
}

#[rstest]
fn test_native_array_script(sweep_params: ConfigTree) {
    let script = sweep_spec(sweep_params, true).assemble().unwrap();
    assert_eq!(
        script,
        "#!/bin/sh\n\
         #SBATCH -J sweep\n\
         #SBATCH --time=01:00:00\n\
         #SBATCH --gres=gpu:2\n\
         #SBATCH --array=0-3\n\
         \n\
         module load python\n\
         cd /work\n\
         optimlr_param=(\"0.1\" \"0.1\" \"0.01\" \"0.01\")\n\
         modelact_param=(\"relu\" \"gelu\" \"relu\" \"gelu\")\n\
         taskId=$SLURM_ARRAY_TASK_ID\n\
         python train.py \"seed=0\" \"optim.lr=${optimlr_param[$taskId]}\" \"optim.name=adam\" \"model.act=${modelact_param[$taskId]}\" --gpus 2\n\
         echo finished"
    );
}

#[rstest]
fn test_parse_recovers_directives_and_params(sweep_params: ConfigTree) {
    let script = sweep_spec(sweep_params, false).assemble().unwrap();
    let parsed = ScriptParser::new(&template()).unwrap().parse(&script).unwrap();

    assert_eq!(parsed.script_name.as_deref(), Some("train.py"));
    let keys: Vec<&str> = parsed.directives.keys().collect();
    assert_eq!(keys, vec!["-J", "--time", "--gres"]);
    assert_eq!(parsed.params.get("seed"), Some(&ParamValue::Int(0)));
    assert_eq!(parsed.params.get("optim.name"), Some(&ParamValue::from("adam")));
    assert_eq!(
        parsed.params.get("model.act"),
        Some(&ParamValue::from(vec!["relu", "gelu", "relu", "gelu"]))
    );
    assert_eq!(parsed.grid_paths, vec!["optim.lr", "model.act"]);
    assert_eq!(parsed.commands, vec!["module load python", "cd /work"]);
    assert_eq!(parsed.post_commands, vec!["echo finished"]);
    assert_eq!(parsed.loop_tasks, Some(4));
}

#[rstest]
fn test_pinned_task_round_trip(sweep_params: ConfigTree) {
    let spec = sweep_spec(sweep_params, false);
    let script = ScriptAssembler::new(&spec)
        .with_task_id(Some(2))
        .assemble()
        .unwrap();
    let parsed = ScriptParser::new(&template()).unwrap().parse(&script).unwrap();

    assert_eq!(parsed.task_id, Some(2));
    assert!(parsed.grid_paths.is_empty());
    assert_eq!(parsed.params.get("optim.lr"), Some(&ParamValue::Float(0.01)));
    assert_eq!(parsed.params.get("model.act"), Some(&ParamValue::from("relu")));
    assert_eq!(spec.task_params(2).unwrap().get("optim.lr"), Some(&ParamValue::Float(0.01)));
}

#[rstest]
#[case(None, false, 1, TaskMode::Single)]
#[case(None, false, 3, TaskMode::Loop(3))]
#[case(Some(1), false, 3, TaskMode::Pinned(1))]
#[case(Some(1), true, 3, TaskMode::NativeArray)]
#[case(None, true, 3, TaskMode::NativeArray)]
fn test_task_mode_priority(
    #[case] task_id: Option<usize>,
    #[case] native_array: bool,
    #[case] n_values: usize,
    #[case] expected: TaskMode,
) {
    let values: Vec<i64> = (0..n_values as i64).collect();
    let mut builder = JobSpec::builder()
        .params(ConfigTree::from_json(&json!({ "x": values })).unwrap())
        .grid_search(GridSearch::new(["x"], vec![]))
        .script_name("main.py")
        .run_command(template());
    if native_array {
        builder = builder.directive("--array", "0-9");
    }
    let spec = builder.build().unwrap();
    assert_eq!(
        ScriptAssembler::new(&spec).with_task_id(task_id).task_mode(),
        expected
    );
}

#[rstest]
fn test_simple_job_with_defaults() {
    let spec = JobSpec::builder()
        .with_defaults(&DirectiveDefaults::default())
        .directive("-J", "job-name")
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
         #SBATCH -o ../%j_out.log\n\
         #SBATCH -e ../%j_err.log\n\
         #SBATCH --time=01:00:00\n\
         \n\
         taskId=0\n\
         python main.py \"script_param=7\""
    );
}

#[rstest]
fn test_exclusions_shape_the_array() {
    let exclude = vec![
        [("a", ParamValue::Int(1)), ("b", ParamValue::Int(3))]
            .into_iter()
            .collect(),
    ];
    let spec = JobSpec::builder()
        .directive("--array", "auto")
        .params(ConfigTree::from_json(&json!({"a": [1, 2], "b": [3, 4]})).unwrap())
        .grid_search(GridSearch::new(["a", "b"], exclude))
        .script_name("main.py")
        .run_command(RunTemplate::parse("python {script_name} {grid_search_params}").unwrap())
        .build()
        .unwrap();

    let script = spec.assemble().unwrap();
    assert!(script.contains("#SBATCH --array=0-2\n"));
    assert!(script.contains("a_param=(\"1\" \"2\" \"2\")\n"));
    assert!(script.contains("b_param=(\"4\" \"3\" \"4\")\n"));
}

#[rstest]
fn test_parse_without_run_line() {
    let parser = ScriptParser::new(&template()).unwrap();
    let result = parser.parse("#!/bin/sh\n#SBATCH -J x\n\necho nothing to see");
    assert!(matches!(result, Err(ScriptError::Parse(_))));
}

#[rstest]
fn test_extra_args_round_trip() {
    let template = RunTemplate::parse("python {script_name} {params} --ckpt {checkpoint_dir}").unwrap();
    let spec = JobSpec::builder()
        .params(ConfigTree::from_json(&json!({"epochs": 10})).unwrap())
        .run_arg("checkpoint_dir", "/scratch/ckpt")
        .script_name("main.py")
        .run_command(template.clone())
        .build()
        .unwrap();
    let script = spec.assemble().unwrap();

    let parsed = ScriptParser::new(&template).unwrap().parse(&script).unwrap();
    assert_eq!(
        parsed.run_args.get("checkpoint_dir").map(String::as_str),
        Some("/scratch/ckpt")
    );
    let rebuilt = parsed.into_builder(template).build().unwrap();
    assert_eq!(rebuilt.assemble().unwrap(), script);
}
