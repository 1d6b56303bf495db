use std::time::Duration;

use thiserror::Error;

use crate::broker::SubscriberKind;

/// Boxed error carried through the broker from a failing subscriber.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised synchronously by coordinator operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Coordinator connection is closed")]
    Closed,

    #[error("Duplicate {kind} subscriber with identifier '{identifier}'")]
    Conflict {
        kind: SubscriberKind,
        identifier: String,
    },

    #[error("Unknown {kind} subscriber '{identifier}'")]
    NotFound {
        kind: SubscriberKind,
        identifier: String,
    },

    #[error("Unknown rpc recipient '{0}'")]
    UnknownRecipient(String),

    #[error("Invalid broadcast filter '{pattern}': {reason}")]
    InvalidFilter { pattern: String, reason: String },
}

/// What a subscriber handler returns when it does not produce a value.
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// The subscriber declined this task; delivery moves on to the next one.
    #[error("Task rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Failed(BoxError),
}

impl SubscriberError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }
}

/// Failure a [`PendingResult`](crate::broker::PendingResult) resolves to.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No task subscriber accepted the message ({subscribers} registered, {rejected} rejected)")]
    NoTaker { subscribers: usize, rejected: usize },

    #[error("Subscriber '{subscriber}' failed: {source}")]
    SubscriberFailed {
        subscriber: String,
        #[source]
        source: BoxError,
    },

    #[error("Result was dropped before it was delivered")]
    Dropped,
}

/// Errors raised by a transport while running remote commands.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport {0} is not open")]
    NotOpen(String),

    #[error("SSH transport requires a host")]
    MissingHost,
}

/// Errors surfaced by scheduler operations (submit, poll, kill, script rendering).
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Error during {operation}, retval={exit_code}\nstdout={stdout}\nstderr={stderr}")]
    CommandFailed {
        operation: &'static str,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Unable to get the job id: stdout={stdout}; stderr={stderr}")]
    EmptySubmitOutput { stdout: String, stderr: String },

    #[error("Unexpected output from the scheduler: {0}")]
    MalformedOutput(String),

    #[error("Found at least one job without job id")]
    MissingJobId,

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid job template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid job resource: {0}")]
    InvalidResource(String),

    #[error("Timed out after {elapsed:?} waiting for job {job_id} to finish")]
    PollTimeout { job_id: String, elapsed: Duration },

    #[error("Polling of job {0} was cancelled")]
    Cancelled(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from the checkpoint store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("No checkpoint stored for process {0}")]
    NotFound(u64),

    #[error("Checkpoint serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors ending a process continuation.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Process was killed: {0}")]
    Killed(String),

    /// Stopped by a daemon shutdown; the process can be continued later from
    /// `resume`.
    #[error("Process was interrupted: {reason}")]
    Interrupted {
        reason: String,
        resume: Option<serde_json::Value>,
    },

    #[error("Unknown process type '{0}'")]
    UnknownType(String),

    #[error("Invalid process inputs: {0}")]
    InvalidInputs(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the runner and the daemon worker lifecycle.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Runner is closed")]
    RunnerClosed,

    #[error("Runner is at capacity ({0} tasks)")]
    AtCapacity(usize),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Daemon worker failed to start: {0}")]
    Startup(String),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Any error the binary can surface.
#[derive(Error, Debug)]
pub enum ProcflowError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcflowError>;
