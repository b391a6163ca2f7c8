//! Batch script rendering and parsing

pub mod assembler;
pub mod job_spec;
pub mod parser;
pub mod template;

pub use assembler::{ScriptAssembler, TaskMode, escape_value};
pub use job_spec::{JobSpec, JobSpecBuilder};
pub use parser::{ParsedScript, ScriptParser};
pub use template::{Placeholder, RunTemplate, Segment, Substitutions};
