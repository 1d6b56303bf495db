use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::daemon::loader::{LoadContext, ProcessFactory};
use crate::daemon::persistence::Checkpoint;
use crate::daemon::process::{Process, ProcessContext};
use crate::error::{ProcessError, SchedulerError};
use crate::scheduler::{
    create_scheduler, poll_until_terminal, JobTemplate, PollOptions, Scheduler, SchedulerKind,
};
use crate::transport::{escape_for_bash, TransportScope};

pub const CALCJOB_PROCESS_TYPE: &str = "calcjob";

/// Inputs of a [`CalcJobProcess`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcJobInputs {
    pub working_directory: String,
    pub filename: String,
    /// Falls back to the profile's scheduler.
    #[serde(default)]
    pub scheduler: Option<SchedulerKind>,
    /// When set, the script is rendered and written to `filename` first.
    #[serde(default)]
    pub template: Option<JobTemplate>,
}

/// Submits one job script and waits for the batch system to finish it.
///
/// Killing the process kills the batch job. A daemon shutdown leaves the job
/// queued or running and records its id, so a continued process goes back to
/// polling instead of submitting again.
pub struct CalcJobProcess {
    pid: u64,
    inputs: CalcJobInputs,
    scheduler: Box<dyn Scheduler>,
    poll: PollOptions,
    job_id: Option<String>,
}

impl CalcJobProcess {
    pub fn new(
        pid: u64,
        inputs: CalcJobInputs,
        scheduler: Box<dyn Scheduler>,
        poll: PollOptions,
    ) -> Self {
        Self {
            pid,
            inputs,
            scheduler,
            poll,
            job_id: None,
        }
    }

    /// Resume tracking an already submitted job.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn factory() -> ProcessFactory {
        std::sync::Arc::new(|checkpoint: &Checkpoint, context: &LoadContext| {
            let inputs: CalcJobInputs = serde_json::from_value(checkpoint.inputs.clone())
                .map_err(|e| ProcessError::InvalidInputs(e.to_string()))?;
            let kind = inputs.scheduler.unwrap_or(context.profile.scheduler.kind);
            let scheduler = create_scheduler(kind, context.transport.clone());
            let poll = context.profile.scheduler.poll_options();
            let mut process = CalcJobProcess::new(checkpoint.pid, inputs, scheduler, poll);
            if let Some(job_id) = checkpoint
                .resume
                .as_ref()
                .and_then(|resume| resume.get("job_id"))
                .and_then(Value::as_str)
            {
                process = process.with_job_id(job_id);
            }
            Ok(Box::new(process) as Box<dyn Process>)
        })
    }

    async fn upload_script(&self, template: &JobTemplate) -> Result<(), SchedulerError> {
        let script = self.scheduler.get_submit_script(template)?;
        let command = format!(
            "printf '%s' {} > {}",
            escape_for_bash(&script),
            escape_for_bash(&self.inputs.filename)
        );
        let output = self
            .scheduler
            .transport()
            .exec_command_wait(&command, Some(&self.inputs.working_directory))
            .await?;
        if !output.success() {
            return Err(SchedulerError::CommandFailed {
                operation: "script upload",
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn kill(&self, job_id: &str) {
        match self.scheduler.kill_job(job_id).await {
            Ok(true) => tracing::info!(pid = self.pid, job_id, "Job killed"),
            Ok(false) => tracing::warn!(pid = self.pid, job_id, "Scheduler refused to kill job"),
            Err(e) => tracing::warn!(pid = self.pid, job_id, error = %e, "Failed to kill job"),
        }
    }

    /// Outcome once cancellation is observed, with `job_id` set after submission.
    async fn stopped(&self, ctx: &ProcessContext, job_id: Option<&str>) -> ProcessError {
        if !ctx.is_killed() {
            tracing::info!(pid = self.pid, job_id = ?job_id, "Daemon stopping, job left to the scheduler");
            return ProcessError::Interrupted {
                reason: "daemon shutdown".to_string(),
                resume: job_id.map(|id| json!({ "job_id": id })),
            };
        }
        match job_id {
            Some(job_id) => {
                self.kill(job_id).await;
                ProcessError::Killed(format!("job {} was killed", job_id))
            }
            None => ProcessError::Killed("killed before submission".to_string()),
        }
    }
}

#[async_trait]
impl Process for CalcJobProcess {
    fn pid(&self) -> u64 {
        self.pid
    }

    fn process_type(&self) -> &str {
        CALCJOB_PROCESS_TYPE
    }

    async fn step_until_terminated(
        self: Box<Self>,
        ctx: ProcessContext,
    ) -> Result<Value, ProcessError> {
        let transport = self.scheduler.transport().clone();
        let _scope = TransportScope::enter(transport.as_ref()).map_err(SchedulerError::from)?;

        let job_id = match &self.job_id {
            Some(job_id) => {
                tracing::info!(pid = self.pid, job_id = %job_id, "Resuming job polling");
                job_id.clone()
            }
            None => {
                if let Some(template) = &self.inputs.template {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(self.stopped(&ctx, None).await),
                        result = self.upload_script(template) => result?,
                    }
                }

                let submitted = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(self.stopped(&ctx, None).await),
                    result = self
                        .scheduler
                        .submit_job(&self.inputs.working_directory, &self.inputs.filename) => result,
                };
                let job_id = submitted?;
                tracing::info!(pid = self.pid, job_id = %job_id, scheduler = %self.scheduler.kind(), "Job submitted");
                job_id
            }
        };

        match poll_until_terminal(self.scheduler.as_ref(), &job_id, &self.poll, &ctx.cancel).await {
            Ok(job) => Ok(json!({
                "job_id": job.job_id,
                "job_state": job.job_state,
                "wallclock_time_seconds": job.wallclock_time_seconds,
            })),
            Err(SchedulerError::Cancelled(_)) => Err(self.stopped(&ctx, Some(&job_id)).await),
            Err(e) => Err(e.into()),
        }
    }
}
