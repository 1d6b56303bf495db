//! Batch scheduler abstraction.
//!
//! A [`Scheduler`] submits, polls and kills jobs on one batch system through a
//! [`Transport`]. Each call is stateless: the scheduler holds nothing but the
//! transport it is bound to.
//!
//! # Backends
//!
//! - [`DirectScheduler`]: runs the script in the background with `bash` and
//!   tracks it through `ps`
//! - [`PbsProScheduler`] and [`TorqueScheduler`]: `qsub` / `qstat -f` / `qdel`
//!
//! # Job lifecycle
//!
//! ```text
//! submitted ─▶ queued | queued_held | running ─▶ suspended ⇄ running ─▶ done
//! ```
//!
//! `Undetermined` is off the path: it is reported when a status code cannot
//! be mapped and is never terminal. [`poll::poll_until_terminal`] keeps
//! polling until `Done`.

pub mod direct;
pub mod job;
pub mod parse;
pub mod pbs;
pub mod poll;
pub mod resource;
pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::transport::{escape_for_bash, Transport};

pub use direct::DirectScheduler;
pub use job::{JobInfo, JobState};
pub use pbs::{PbsProScheduler, TorqueScheduler};
pub use poll::{poll_until_terminal, PollOptions};
pub use resource::{JobResource, ResourceRequest};
pub use template::JobTemplate;

/// Batch systems with a scheduler implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Direct,
    Pbspro,
    Torque,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Direct => write!(f, "direct"),
            SchedulerKind::Pbspro => write!(f, "pbspro"),
            SchedulerKind::Torque => write!(f, "torque"),
        }
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(SchedulerKind::Direct),
            "pbspro" => Ok(SchedulerKind::Pbspro),
            "torque" => Ok(SchedulerKind::Torque),
            other => Err(SchedulerError::InvalidQuery(format!(
                "unknown scheduler '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Transport this scheduler runs its commands through. Assumed open.
    fn transport(&self) -> &Arc<dyn Transport>;

    /// Whether the job resource may carry a memory limit per machine.
    fn accepts_memory_per_machine(&self) -> bool;

    /// Whether `get_jobs` honours the `user` filter.
    fn can_query_by_user(&self) -> bool;

    /// Backend specific header lines (directives, redirection, environment).
    fn submit_script_header(&self, template: &JobTemplate) -> Result<Vec<String>, SchedulerError>;

    /// Render the full submission script. Pure with respect to `template`.
    fn get_submit_script(&self, template: &JobTemplate) -> Result<String, SchedulerError> {
        let header = self.submit_script_header(template)?;
        Ok(render_submit_script(template, header))
    }

    /// Submit `filename` (relative to `working_directory`) and return the job id.
    async fn submit_job(
        &self,
        working_directory: &str,
        filename: &str,
    ) -> Result<String, SchedulerError>;

    /// List jobs, optionally restricted to `jobs` or to the jobs of `user`.
    ///
    /// Requested ids missing from the output are reported as `Done`.
    async fn get_jobs(
        &self,
        jobs: Option<&[String]>,
        user: Option<&str>,
    ) -> Result<Vec<JobInfo>, SchedulerError>;

    /// Same as [`Scheduler::get_jobs`], keyed by job id.
    async fn get_jobs_map(
        &self,
        jobs: Option<&[String]>,
        user: Option<&str>,
    ) -> Result<BTreeMap<String, JobInfo>, SchedulerError> {
        let list = self.get_jobs(jobs, user).await?;
        jobs_by_id(list)
    }

    /// Ask the batch system to kill `job_id`. `Ok(false)` if the command was refused.
    async fn kill_job(&self, job_id: &str) -> Result<bool, SchedulerError>;
}

/// Build a scheduler of `kind` bound to `transport`.
pub fn create_scheduler(kind: SchedulerKind, transport: Arc<dyn Transport>) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Direct => Box::new(DirectScheduler::new(transport)),
        SchedulerKind::Pbspro => Box::new(PbsProScheduler::new(transport)),
        SchedulerKind::Torque => Box::new(TorqueScheduler::new(transport)),
    }
}

/// Collapse a job list by id. A record without an id is a hard failure.
pub fn jobs_by_id(list: Vec<JobInfo>) -> Result<BTreeMap<String, JobInfo>, SchedulerError> {
    let mut map = BTreeMap::new();
    for job in list {
        if job.job_id.is_empty() {
            return Err(SchedulerError::MissingJobId);
        }
        map.insert(job.job_id.clone(), job);
    }
    Ok(map)
}

/// Append a `Done` record for every requested id absent from `list`.
pub(crate) fn add_missing_as_done(list: &mut Vec<JobInfo>, requested: Option<&[String]>) {
    let Some(requested) = requested else {
        return;
    };
    for job_id in requested {
        if job_id.is_empty() || list.iter().any(|job| &job.job_id == job_id) {
            continue;
        }
        tracing::debug!(job_id = %job_id, "Job no longer listed, assuming it finished");
        list.push(JobInfo::finished(job_id.clone()));
    }
}

/// Shared handling of a submit command's output: the stripped stdout is the id.
pub(crate) fn parse_submit_output(
    transport: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> Result<String, SchedulerError> {
    if exit_code != 0 {
        tracing::error!(exit_code, stdout, stderr, "Error in submit output");
        return Err(SchedulerError::CommandFailed {
            operation: "submission",
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    if !stderr.trim().is_empty() {
        tracing::warn!(transport, stderr, "There was some text in stderr of the submit command");
    }

    let job_id = stdout.trim();
    if job_id.is_empty() {
        return Err(SchedulerError::EmptySubmitOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }
    Ok(job_id.to_string())
}

/// Shared handling of a kill command's output.
pub(crate) fn parse_kill_output(transport: &str, exit_code: i32, stdout: &str, stderr: &str) -> bool {
    if exit_code != 0 {
        tracing::error!(exit_code, stdout, stderr, "Error in kill output");
        return false;
    }
    if !stderr.trim().is_empty() {
        tracing::warn!(transport, stderr, "There was some text in stderr of the kill command");
    }
    if !stdout.trim().is_empty() {
        tracing::warn!(transport, stdout, "There was some text in stdout of the kill command");
    }
    true
}

fn environment_lines(template: &JobTemplate) -> Vec<String> {
    if template.job_environment.is_empty() {
        return Vec::new();
    }
    let mut lines = vec!["# ENVIRONMENT VARIABLES BEGIN ###".to_string()];
    for (key, value) in &template.job_environment {
        lines.push(format!("export {}={}", key.trim(), escape_for_bash(value)));
    }
    lines.push("# ENVIRONMENT VARIABLES  END  ###".to_string());
    lines
}

/// Join shebang, header, environment block and caller payload into a script.
pub fn render_submit_script(template: &JobTemplate, header: Vec<String>) -> String {
    let mut lines = vec![template.shebang().to_string()];
    lines.extend(header);
    lines.push(String::new());

    let environment = environment_lines(template);
    if !environment.is_empty() {
        lines.extend(environment);
        lines.push(String::new());
    }

    if let Some(prepend) = template.prepend_text.as_deref().filter(|t| !t.is_empty()) {
        lines.push(prepend.to_string());
        lines.push(String::new());
    }

    lines.extend(template.codes_run_lines.iter().cloned());

    if let Some(append) = template.append_text.as_deref().filter(|t| !t.is_empty()) {
        lines.push(String::new());
        lines.push(append.to_string());
    }

    let mut script = lines.join("\n");
    script.push('\n');
    script
}
