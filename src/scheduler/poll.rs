use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::scheduler::{JobInfo, Scheduler};

/// How often and for how long to poll a submitted job.
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until the job finishes.
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: None,
        }
    }
}

impl PollOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Poll `job_id` until the scheduler reports it `Done`.
///
/// A job missing from the listing is reported `Done` by the scheduler, so a
/// purged job terminates the loop too. `Undetermined` keeps polling.
pub async fn poll_until_terminal(
    scheduler: &dyn Scheduler,
    job_id: &str,
    options: &PollOptions,
    cancel: &CancellationToken,
) -> Result<JobInfo, SchedulerError> {
    let started = Instant::now();
    let requested = [job_id.to_string()];

    loop {
        let jobs = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SchedulerError::Cancelled(job_id.to_string()));
            }
            result = scheduler.get_jobs_map(Some(requested.as_slice()), None) => result?,
        };
        match jobs.get(job_id) {
            Some(job) if job.job_state.is_terminal() => {
                tracing::info!(job_id, "Job finished");
                return Ok(job.clone());
            }
            Some(job) => {
                tracing::debug!(job_id, job_state = %job.job_state, "Job not finished yet");
            }
            None => {
                tracing::warn!(job_id, "Job missing from the scheduler listing");
            }
        }

        let mut wait = options.interval;
        if let Some(timeout) = options.timeout {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SchedulerError::PollTimeout {
                    job_id: job_id.to_string(),
                    elapsed,
                });
            }
            wait = wait.min(timeout - elapsed);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SchedulerError::Cancelled(job_id.to_string()));
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
