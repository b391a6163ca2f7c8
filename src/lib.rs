//! Generate, submit and parse Slurm batch scripts
//!
//! A job is described by scheduler directives, nested script parameters and a
//! run-command template. Selected list parameters can be grid-searched: every
//! surviving combination becomes one task, run as a native job array, a shell
//! loop, or one script per task.
//!
//! ```no_run
//! use autobatch::params::{ConfigTree, GridSearch};
//! use autobatch::script::{JobSpec, RunTemplate};
//!
//! # fn main() -> autobatch::errors::Result<()> {
//! let params = ConfigTree::from_json(&serde_json::json!({"lr": [0.1, 0.01]}))?;
//! let spec = JobSpec::builder()
//!     .directive("--array", "auto")
//!     .params(params)
//!     .grid_search(GridSearch::new(["lr"], vec![]))
//!     .script_name("train.py")
//!     .run_command(RunTemplate::parse("python {script_name} {all_params}")?)
//!     .build()?;
//! println!("{}", spec.assemble()?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod hpc;
pub mod params;
pub mod request;
pub mod script;

pub use errors::ScriptError;
pub use request::JobRequest;
pub use script::{JobSpec, JobSpecBuilder, ParsedScript, RunTemplate, ScriptAssembler, ScriptParser};
