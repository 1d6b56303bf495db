use std::sync::Arc;

use serde_json::{json, Value};

use crate::broker::{TaskHandler, TaskMessage};
use crate::daemon::loader::{LoadContext, ObjectLoader};
use crate::daemon::persistence::{Checkpoint, Persister};
use crate::daemon::runner::Runner;
use crate::error::{DaemonError, SubscriberError};

/// Task subscriber that turns task messages into running processes.
///
/// Called synchronously by the coordinator. Rejects work while the runner is
/// full or shutting down so another worker can take it.
pub struct ProcessLauncher {
    runner: Runner,
    persister: Arc<dyn Persister>,
    load_context: LoadContext,
    loader: ObjectLoader,
}

impl ProcessLauncher {
    pub fn new(
        runner: Runner,
        persister: Arc<dyn Persister>,
        load_context: LoadContext,
        loader: ObjectLoader,
    ) -> Self {
        Self {
            runner,
            persister,
            load_context,
            loader,
        }
    }

    pub fn handle(&self, message: &TaskMessage) -> Result<Value, SubscriberError> {
        if self.runner.is_closing() {
            return Err(SubscriberError::rejected("daemon worker is shutting down"));
        }
        if self.runner.task_count() >= self.runner.max_tasks() {
            return Err(SubscriberError::rejected(format!(
                "daemon worker is at capacity ({} tasks)",
                self.runner.max_tasks()
            )));
        }

        match message {
            TaskMessage::Continue { pid, nowait } => {
                // The ack is sent once the continuation is scheduled either way.
                tracing::debug!(pid, nowait, "Continue task received");
                self.continue_process(*pid)
            }
            TaskMessage::Launch {
                process_type,
                inputs,
            } => self.launch_process(process_type, inputs.clone()),
            TaskMessage::Custom(_) => Err(SubscriberError::rejected("unsupported task message")),
        }
    }

    fn launch_process(&self, process_type: &str, inputs: Value) -> Result<Value, SubscriberError> {
        if !self.loader.knows(process_type) {
            return Err(SubscriberError::failed(format!(
                "unknown process type '{}'",
                process_type
            )));
        }

        let pid = self.persister.next_pid();
        let checkpoint = Checkpoint::new(pid, process_type, inputs);
        self.persister
            .save_checkpoint(&checkpoint)
            .map_err(SubscriberError::failed)?;
        tracing::info!(pid, process_type, "Process created");

        self.continue_process(pid).inspect_err(|_| {
            // A launch that never started leaves no checkpoint behind.
            if let Err(e) = self.persister.delete_checkpoint(pid) {
                tracing::warn!(pid, error = %e, "Failed to remove checkpoint of unstarted process");
            }
        })
    }

    fn continue_process(&self, pid: u64) -> Result<Value, SubscriberError> {
        let checkpoint = self
            .persister
            .load_checkpoint(pid)
            .map_err(SubscriberError::failed)?;

        if checkpoint.state.is_terminal() {
            tracing::info!(pid, state = %checkpoint.state, "Process already terminated");
            return Ok(json!({ "pid": pid, "state": checkpoint.state }));
        }

        let process = self
            .loader
            .load(&checkpoint, &self.load_context)
            .map_err(SubscriberError::failed)?;

        self.runner
            .spawn_process(process, checkpoint)
            .map_err(|e| match e {
                DaemonError::AtCapacity(_) | DaemonError::RunnerClosed => {
                    SubscriberError::rejected(e.to_string())
                }
                other => SubscriberError::failed(other),
            })?;

        Ok(json!({ "pid": pid }))
    }

    pub fn into_subscriber(self) -> TaskHandler {
        let launcher = Arc::new(self);
        Arc::new(move |message: &TaskMessage| launcher.handle(message))
    }
}
