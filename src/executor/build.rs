use std::fmt::Write;
use std::time::Duration;

use anyhow::{bail, Result};
use crossterm::style::{Attribute, Color, SetForegroundColor};

use crate::gitlab::Job;

/// Synthesizes the shell scripts run inside the microVM for one job.
#[derive(Debug)]
pub struct Build {
    job: Job,
    /// relative to the VM user's home
    working_dir: String,
}

impl Build {
    pub fn new(job: Job, working_dir: &str) -> Result<Self> {
        if working_dir.is_empty() {
            bail!("working directory can not be empty");
        }
        let build = Self {
            job,
            working_dir: working_dir.to_string(),
        };
        // reject unsupported steps before any VM work happens
        build.build_script()?;
        Ok(build)
    }

    /// Script cloning the repository and checking out the ref.
    pub fn prepare_script(&self) -> String {
        let git = &self.job.git_info;
        format!(
            "set -euo pipefail\ngit clone -b {} --single-branch --depth {} {} {}\n",
            git.reference, git.depth, git.repo_url, self.working_dir
        )
    }

    /// Script exporting the job variables and running the user steps.
    pub fn build_script(&self) -> Result<String> {
        let mut script = String::new();
        script.push_str("set -euo pipefail\n");
        let _ = writeln!(script, "cd ~/{}", self.working_dir);

        for variable in &self.job.variables {
            let _ = writeln!(
                script,
                "export {}={}",
                variable.key,
                shell_escape(&variable.value)
            );
        }

        // run user script
        for (idx, step) in self.job.steps.iter().enumerate() {
            if step.when != "on_success" {
                bail!(
                    "tart only support on_success step, got {:?} on step {:?}",
                    step.when,
                    step.name
                );
            }

            script.push_str("set +x\n");
            let step_name = if step.name.is_empty() {
                idx.to_string()
            } else {
                step.name.clone()
            };
            let _ = writeln!(
                script,
                "echo {}running step {}...{}",
                SetForegroundColor(Color::DarkBlue),
                step_name,
                Attribute::Reset
            );
            script.push_str("set -x\n");

            for line in &step.script {
                script.push_str(line);
                script.push('\n');
            }
        }

        Ok(script)
    }

    /// Aggregate budget for script execution: the sum of the timeouts of the
    /// steps that run.
    pub fn timeout(&self) -> Duration {
        let seconds: u64 = self
            .job
            .steps
            .iter()
            .filter(|step| step.when == "on_success")
            .map(|step| step.timeout)
            .sum();
        Duration::from_secs(seconds)
    }
}

/// Escapes a string so that it passes through a POSIX shell as one word with
/// its exact bytes.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"%+=:,./-_@".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
