//! Submission of job specifications

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::runner::{ProcessOutput, ProcessRunner};
use crate::params::OrderedMap;
use crate::script::{JobSpec, ScriptAssembler};

/// One rendered script and what happened to it
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    /// Task the script was pinned to, if any
    pub task_id: Option<usize>,
    pub script: String,
    /// Where the script was saved, if requested
    pub saved_to: Option<PathBuf>,
    /// Runner output; `None` for dry runs
    pub output: Option<ProcessOutput>,
}

/// Renders, optionally saves, and submits the scripts of a job
pub struct Submitter<'a> {
    runner: &'a dyn ProcessRunner,
    schedule_all_tasks: bool,
    save_path: Option<PathBuf>,
    dry_run: bool,
    extra_args: OrderedMap<String>,
}

impl<'a> Submitter<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self {
            runner,
            schedule_all_tasks: false,
            save_path: None,
            dry_run: false,
            extra_args: OrderedMap::new(),
        }
    }

    /// Submit one pinned script per task instead of a single loop script.
    ///
    /// Ignored for native job arrays, where Slurm already fans out.
    pub fn schedule_all_tasks(mut self, enabled: bool) -> Self {
        self.schedule_all_tasks = enabled;
        self
    }

    pub fn save_to(mut self, path: Option<PathBuf>) -> Self {
        self.save_path = path;
        self
    }

    /// Render and save without running anything
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn with_args(mut self, args: &OrderedMap<String>) -> Self {
        for (key, value) in args.iter() {
            self.extra_args.insert(key, value.clone());
        }
        self
    }

    /// Task ids to render, one script each
    pub fn task_ids(&self, spec: &JobSpec, task_id: Option<usize>) -> Vec<Option<usize>> {
        if self.schedule_all_tasks && !spec.has_native_array() {
            (0..spec.n_jobs()).map(Some).collect()
        } else {
            vec![task_id]
        }
    }

    pub fn submit(&self, spec: &JobSpec, task_id: Option<usize>) -> Result<Vec<SubmissionRecord>> {
        let task_ids = self.task_ids(spec, task_id);
        if task_ids.len() > 1 {
            info!(
                "Scheduling {} tasks of '{}' as separate jobs",
                task_ids.len(),
                spec.script_name()
            );
        }

        let mut records = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let script = ScriptAssembler::new(spec)
                .with_task_id(task_id)
                .with_args(&self.extra_args)
                .assemble()
                .with_context(|| format!("Failed to assemble script for task {:?}", task_id))?;

            let saved_to = match &self.save_path {
                Some(path) => Some(save_script(&script, path, task_id)?),
                None => None,
            };

            let output = if self.dry_run {
                debug!("Dry run, not submitting task {:?}", task_id);
                None
            } else {
                Some(self.runner.execute(&script)?)
            };

            records.push(SubmissionRecord {
                task_id,
                script,
                saved_to,
                output,
            });
        }
        Ok(records)
    }
}

/// Write a script to `path`, suffixed with `_<task>` for task-pinned scripts.
///
/// The file is made executable on Unix. Returns the path written.
pub fn save_script(script: &str, path: &Path, task_id: Option<usize>) -> Result<PathBuf> {
    let path = match task_id {
        Some(task_id) => {
            let mut name = path
                .file_name()
                .with_context(|| format!("Cannot save a script to {:?}", path))?
                .to_os_string();
            name.push(format!("_{}", task_id));
            path.with_file_name(name)
        }
        None => path.to_path_buf(),
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    fs::write(&path, script).with_context(|| format!("Failed to write script to {:?}", path))?;

    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    debug!("Saved script to {:?}", path);
    Ok(path)
}
