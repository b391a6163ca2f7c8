//! Execution of rendered scripts

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, trace};
use regex::Regex;
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

/// Environment variable naming a stand-in for `sbatch`, used by tests
pub const FAKE_SBATCH_ENV: &str = "AUTOBATCH_FAKE_SBATCH";

/// Captured result of running a script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Runs a complete script and waits for the launcher, never for the job
pub trait ProcessRunner {
    fn execute(&self, script: &str) -> Result<ProcessOutput>;
}

/// Hands scripts to `sbatch` on stdin
pub struct SbatchRunner {
    exec: String,
    job_id_regex: Regex,
}

impl SbatchRunner {
    /// Create a runner for `exec`, or `sbatch` when none is given.
    ///
    /// `AUTOBATCH_FAKE_SBATCH` takes precedence over both.
    pub fn new(exec: Option<&str>) -> Result<Self> {
        let exec = env::var(FAKE_SBATCH_ENV)
            .ok()
            .or_else(|| exec.map(str::to_string))
            .unwrap_or_else(|| "sbatch".to_string());
        let job_id_regex = Regex::new(r"Submitted batch job (\d+)")?;
        Ok(Self { exec, job_id_regex })
    }

    pub fn exec(&self) -> &str {
        &self.exec
    }

    /// Scheduler job id announced in sbatch output
    pub fn job_id(&self, stdout: &str) -> Option<String> {
        self.job_id_regex
            .captures(stdout)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl ProcessRunner for SbatchRunner {
    fn execute(&self, script: &str) -> Result<ProcessOutput> {
        trace!("Running {} with script:\n{}", self.exec, script);
        let mut child = Command::new(&self.exec)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start '{}'", self.exec))?;

        // stdin is fed while stdout and stderr are drained
        let mut stdin = child
            .stdin
            .take()
            .context("Failed to open stdin of the scheduler process")?;
        let input = script.as_bytes().to_vec();
        let writer = thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", self.exec))?;
        writer
            .join()
            .map_err(|_| anyhow!("Writer thread for '{}' panicked", self.exec))?
            .with_context(|| format!("Failed to pass the script to '{}'", self.exec))?;
        let result = ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            return_code: output.status.code().unwrap_or(-1),
        };

        if !result.success() {
            error!(
                "{} failed with return code {}: {}",
                self.exec,
                result.return_code,
                result.stderr.trim()
            );
        } else if let Some(job_id) = self.job_id(&result.stdout) {
            info!("Submitted batch job {}", job_id);
        } else {
            debug!("No job id in {} output: {}", self.exec, result.stdout.trim());
        }
        Ok(result)
    }
}
