//! Boundaries to the HPC environment
//!
//! Script generation itself is pure. Everything that touches the outside
//! world lives here: where setup commands come from, how a script is handed
//! to the scheduler, and how scripts are persisted.

pub mod runner;
pub mod setup;
pub mod submitter;

pub use runner::{ProcessOutput, ProcessRunner, SbatchRunner};
pub use setup::{SetupProvider, StaticSetup};
pub use submitter::{SubmissionRecord, Submitter, save_script};
