//! PBS-family schedulers (PBS Pro, Torque).
//!
//! Both dialects share submission (`qsub`), listing (`qstat -f`), killing
//! (`qdel`) and most of the script header. They only differ in how resource
//! requests are spelled, which is captured by [`PbsDialect`].

pub mod pbspro;
pub mod torque;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SchedulerError;
use crate::scheduler::parse::parse_walltime;
use crate::scheduler::{
    add_missing_as_done, parse_kill_output, parse_submit_output, JobInfo, JobState, JobTemplate,
    Scheduler, SchedulerKind,
};
use crate::transport::{escape_for_bash, Transport, TransportScope};

pub use pbspro::PbsPro;
pub use torque::Torque;

pub type PbsProScheduler = PbsScheduler<PbsPro>;
pub type TorqueScheduler = PbsScheduler<Torque>;

/// Validated numbers a dialect turns into `#PBS -l` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub num_machines: u32,
    pub num_mpiprocs_per_machine: Option<u32>,
    pub num_cores_per_machine: Option<u32>,
    pub max_memory_kb: Option<u64>,
    pub max_wallclock_seconds: Option<u64>,
}

/// What differs between PBS flavours.
pub trait PbsDialect: Send + Sync + 'static {
    const KIND: SchedulerKind;

    fn resource_lines(limits: &ResourceLimits) -> Vec<String>;
}

/// Map a `qstat` state letter to a job state.
pub fn map_pbs_status(code: &str) -> Option<JobState> {
    match code {
        "B" | "E" | "R" => Some(JobState::Running),
        "C" | "F" | "X" => Some(JobState::Done),
        "H" => Some(JobState::QueuedHeld),
        "Q" | "T" | "W" => Some(JobState::Queued),
        "S" | "U" => Some(JobState::Suspended),
        "M" => Some(JobState::Undetermined),
        _ => None,
    }
}

/// Make `name` acceptable to `#PBS -N`: starts with a letter, only
/// `[A-Za-z0-9_.-]`, at most 15 characters.
pub fn sanitize_job_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let mut sanitized = match cleaned.chars().next() {
        Some(first) if first.is_ascii_alphabetic() => cleaned,
        _ => format!("j{}", cleaned),
    };
    sanitized.truncate(15);
    sanitized
}

fn positive(name: &str, value: Option<i64>) -> Result<Option<u64>, SchedulerError> {
    match value {
        None => Ok(None),
        Some(v) if v > 0 => Ok(Some(v as u64)),
        Some(v) => Err(SchedulerError::InvalidTemplate(format!(
            "{} must be a positive integer! It is instead '{}'",
            name, v
        ))),
    }
}

/// One attribute block of `qstat -f` output.
#[derive(Debug, Default)]
struct RawJob {
    job_id: String,
    attributes: Vec<(String, String)>,
}

impl RawJob {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn split_blocks(stdout: &str) -> Vec<RawJob> {
    let mut blocks: Vec<RawJob> = Vec::new();

    for line in stdout.lines() {
        if let Some(id) = line.strip_prefix("Job Id:") {
            blocks.push(RawJob {
                job_id: id.trim().to_string(),
                attributes: Vec::new(),
            });
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some(block) = blocks.last_mut() else {
            tracing::debug!(line, "Ignoring qstat line outside of a job block");
            continue;
        };

        // Long values wrap onto tab indented continuation lines without '='.
        let continuation = line.starts_with('\t') || !line.contains(" = ");
        match (continuation, line.split_once('=')) {
            (false, Some((key, value))) => block
                .attributes
                .push((key.trim().to_string(), value.trim().to_string())),
            _ => match block.attributes.last_mut() {
                Some((_, value)) => value.push_str(line.trim()),
                None => tracing::warn!(line, "Continuation line without an attribute"),
            },
        }
    }
    blocks
}

fn job_from_block(raw: &RawJob) -> JobInfo {
    let mut job = JobInfo::new(raw.job_id.clone(), JobState::Undetermined);

    match raw.get("job_state") {
        Some(code) => {
            job.raw_state = Some(code.to_string());
            match map_pbs_status(code) {
                Some(state) => job.job_state = state,
                None => tracing::warn!(
                    job_id = %job.job_id,
                    job_state = code,
                    "Unrecognized job_state"
                ),
            }
        }
        None => tracing::debug!(job_id = %job.job_id, "No 'job_state' field"),
    }

    // Job_Owner is user@host; keep the user only.
    job.job_owner = raw
        .get("Job_Owner")
        .map(|owner| owner.split('@').next().unwrap_or(owner).to_string());
    job.title = raw.get("Job_Name").map(str::to_string);
    job.queue_name = raw.get("queue").map(str::to_string);

    if let Some(walltime) = raw.get("resources_used.walltime") {
        match parse_walltime(walltime) {
            Ok(seconds) => job.wallclock_time_seconds = Some(seconds),
            Err(e) => tracing::warn!(
                job_id = %job.job_id,
                error = %e,
                "Error parsing 'resources_used.walltime'"
            ),
        }
    }
    if let Some(walltime) = raw.get("Resource_List.walltime") {
        match parse_walltime(walltime) {
            Ok(seconds) => job.requested_wallclock_time_seconds = Some(seconds),
            Err(e) => tracing::warn!(
                job_id = %job.job_id,
                error = %e,
                "Error parsing 'Resource_List.walltime'"
            ),
        }
    }

    job.num_machines = raw
        .get("Resource_List.nodect")
        .and_then(|v| v.parse().ok());
    job.num_mpiprocs = raw
        .get("Resource_List.ncpus")
        .and_then(|v| v.parse().ok());

    job
}

fn is_finished_job_notice(line: &str) -> bool {
    line.contains("Unknown Job Id") || line.contains("Job has finished")
}

/// Parse `qstat -f` output into job records.
pub fn parse_joblist_output(
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> Result<Vec<JobInfo>, SchedulerError> {
    // qstat exits non-zero when a requested job is unknown; those jobs have
    // left the queue and are reported as finished by the caller.
    let filtered: Vec<&str> = stderr
        .lines()
        .filter(|line| !line.trim().is_empty() && !is_finished_job_notice(line))
        .collect();

    if !filtered.is_empty() {
        tracing::warn!(stderr = %filtered.join("\n"), "Non-empty stderr while listing PBS jobs");
        if exit_code != 0 {
            return Err(SchedulerError::CommandFailed {
                operation: "qstat parsing",
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        }
    }

    let jobs: Vec<JobInfo> = split_blocks(stdout).iter().map(job_from_block).collect();
    if jobs.iter().any(|job| job.job_id.is_empty()) {
        return Err(SchedulerError::MalformedOutput(
            "'Job Id:' line without an identifier".to_string(),
        ));
    }
    Ok(jobs)
}

/// A PBS-family scheduler parameterised by its dialect.
pub struct PbsScheduler<D: PbsDialect> {
    transport: Arc<dyn Transport>,
    _dialect: PhantomData<D>,
}

impl<D: PbsDialect> PbsScheduler<D> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            _dialect: PhantomData,
        }
    }

    pub fn joblist_command(
        jobs: Option<&[String]>,
        user: Option<&str>,
    ) -> Result<String, SchedulerError> {
        let mut command = "qstat -f".to_string();
        let ids: Vec<String> = jobs
            .unwrap_or_default()
            .iter()
            .filter(|job| !job.is_empty())
            .map(|job| escape_for_bash(job))
            .collect();

        if let Some(user) = user {
            if !ids.is_empty() {
                return Err(SchedulerError::InvalidQuery(
                    "cannot query by user and job(s) in PBS".to_string(),
                ));
            }
            command.push_str(&format!(" -u {}", escape_for_bash(user)));
        }
        if !ids.is_empty() {
            command.push(' ');
            command.push_str(&ids.join(" "));
        }
        Ok(command)
    }

    fn resource_limits(template: &JobTemplate) -> Result<ResourceLimits, SchedulerError> {
        let resource = template.job_resource.as_ref().ok_or_else(|| {
            SchedulerError::InvalidTemplate("PBS submissions require a job resource".to_string())
        })?;
        Ok(ResourceLimits {
            num_machines: resource.num_machines,
            num_mpiprocs_per_machine: Some(resource.num_mpiprocs_per_machine),
            num_cores_per_machine: resource.num_cores_per_machine,
            max_memory_kb: positive("max_memory_kb", template.max_memory_kb)?,
            max_wallclock_seconds: positive("max_wallclock_seconds", template.max_wallclock_seconds)?,
        })
    }
}

#[async_trait]
impl<D: PbsDialect> Scheduler for PbsScheduler<D> {
    fn kind(&self) -> SchedulerKind {
        D::KIND
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn accepts_memory_per_machine(&self) -> bool {
        true
    }

    fn can_query_by_user(&self) -> bool {
        false
    }

    fn submit_script_header(&self, template: &JobTemplate) -> Result<Vec<String>, SchedulerError> {
        let mut lines = Vec::new();

        if template.submit_as_hold {
            lines.push("#PBS -h".to_string());
        }
        lines.push(if template.rerunnable { "#PBS -r y" } else { "#PBS -r n" }.to_string());

        if let Some(email) = &template.email {
            lines.push(format!("#PBS -M {}", email));
        }
        let mut mail_events = String::new();
        if template.email_on_started {
            mail_events.push('b');
        }
        if template.email_on_terminated {
            mail_events.push_str("ea");
        }
        if mail_events.is_empty() {
            lines.push("#PBS -m n".to_string());
        } else {
            lines.push(format!("#PBS -m {}", mail_events));
        }

        if let Some(name) = &template.job_name {
            lines.push(format!("#PBS -N {}", sanitize_job_name(name)));
        }

        if let Some(output) = &template.sched_output_path {
            lines.push(format!("#PBS -o {}", output));
        }
        if template.sched_join_files {
            lines.push("#PBS -j oe".to_string());
            if template.sched_error_path.is_some() {
                tracing::info!("sched_join_files is set, ignoring sched_error_path");
            }
        } else if let Some(error) = &template.sched_error_path {
            lines.push(format!("#PBS -e {}", error));
        }

        if template.import_sys_environment {
            lines.push("#PBS -V".to_string());
        }
        if let Some(queue) = &template.queue_name {
            lines.push(format!("#PBS -q {}", queue));
        }
        if let Some(account) = &template.account {
            lines.push(format!("#PBS -A {}", account));
        }
        if let Some(priority) = &template.priority {
            lines.push(format!("#PBS -p {}", priority));
        }

        let limits = Self::resource_limits(template)?;
        lines.extend(D::resource_lines(&limits));

        if let Some(custom) = &template.custom_scheduler_commands {
            lines.push(custom.clone());
        }

        // PBS starts jobs in the home directory.
        lines.push("cd \"$PBS_O_WORKDIR\"".to_string());

        Ok(lines)
    }

    async fn submit_job(
        &self,
        working_directory: &str,
        filename: &str,
    ) -> Result<String, SchedulerError> {
        let command = format!("qsub {}", escape_for_bash(filename));
        tracing::info!(scheduler = %D::KIND, command = %command, working_directory, "Submitting job");

        let output = self
            .transport
            .exec_command_wait(&command, Some(working_directory))
            .await?;
        parse_submit_output(
            &self.transport.describe(),
            output.exit_code,
            &output.stdout,
            &output.stderr,
        )
    }

    async fn get_jobs(
        &self,
        jobs: Option<&[String]>,
        user: Option<&str>,
    ) -> Result<Vec<JobInfo>, SchedulerError> {
        let command = Self::joblist_command(jobs, user)?;
        let output = {
            let _scope = TransportScope::enter(self.transport.as_ref())?;
            self.transport.exec_command_wait(&command, None).await?
        };

        let mut list = parse_joblist_output(output.exit_code, &output.stdout, &output.stderr)?;
        add_missing_as_done(&mut list, jobs);
        Ok(list)
    }

    async fn kill_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let command = format!("qdel {}", escape_for_bash(job_id));
        tracing::info!(scheduler = %D::KIND, job_id, "Killing job");

        let output = self.transport.exec_command_wait(&command, None).await?;
        Ok(parse_kill_output(
            &self.transport.describe(),
            output.exit_code,
            &output.stdout,
            &output.stderr,
        ))
    }
}
