use serde::{Deserialize, Serialize};

/// Normalized state of a batch job as reported by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The status code could not be parsed or is unknown. Never terminal.
    Undetermined,
    Queued,
    QueuedHeld,
    Running,
    Suspended,
    Done,
}

impl JobState {
    /// Only `Done` is terminal; every other state must be polled again.
    pub fn is_terminal(self) -> bool {
        self == JobState::Done
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Undetermined => write!(f, "undetermined"),
            JobState::Queued => write!(f, "queued"),
            JobState::QueuedHeld => write!(f, "queued_held"),
            JobState::Running => write!(f, "running"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::Done => write!(f, "done"),
        }
    }
}

/// Snapshot of a job built from one poll of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub job_state: JobState,
    pub job_owner: Option<String>,
    /// Consumed wall time; unknown until the job starts running.
    pub wallclock_time_seconds: Option<u64>,
    pub requested_wallclock_time_seconds: Option<u64>,
    pub title: Option<String>,
    pub queue_name: Option<String>,
    pub num_machines: Option<u32>,
    pub num_mpiprocs: Option<u32>,
    /// Status code exactly as the backend printed it.
    pub raw_state: Option<String>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, job_state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            job_state,
            job_owner: None,
            wallclock_time_seconds: None,
            requested_wallclock_time_seconds: None,
            title: None,
            queue_name: None,
            num_machines: None,
            num_mpiprocs: None,
            raw_state: None,
        }
    }

    /// Record for a requested job that no longer shows up in the queue.
    pub fn finished(job_id: impl Into<String>) -> Self {
        Self::new(job_id, JobState::Done)
    }
}
