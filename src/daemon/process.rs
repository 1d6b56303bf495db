use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::broker::ProcessController;
use crate::error::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Waiting,
    Finished,
    Excepted,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::Excepted | ProcessState::Killed
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Waiting => write!(f, "waiting"),
            ProcessState::Finished => write!(f, "finished"),
            ProcessState::Excepted => write!(f, "excepted"),
            ProcessState::Killed => write!(f, "killed"),
        }
    }
}

/// What a running process gets from the runner.
#[derive(Clone)]
pub struct ProcessContext {
    pub pid: u64,
    /// Cancelled when the process is killed or the daemon shuts down.
    pub cancel: CancellationToken,
    /// Cancelled by a kill request only.
    pub kill: CancellationToken,
    pub controller: ProcessController,
}

impl ProcessContext {
    /// True when cancellation came from a kill request rather than a shutdown.
    ///
    /// A killed process releases what it started (e.g. its batch job) and
    /// ends as killed; an interrupted one leaves it running and returns
    /// [`ProcessError::Interrupted`] so it can be continued.
    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// A unit of work the daemon drives to completion.
#[async_trait]
pub trait Process: Send {
    fn pid(&self) -> u64;

    fn process_type(&self) -> &str;

    /// Run until the process finishes, fails or observes cancellation.
    ///
    /// On cancellation, return [`ProcessError::Killed`] when
    /// [`ProcessContext::is_killed`] holds and [`ProcessError::Interrupted`]
    /// otherwise.
    ///
    /// The returned value is stored as the process outputs.
    async fn step_until_terminated(self: Box<Self>, ctx: ProcessContext)
        -> Result<Value, ProcessError>;
}
