use std::fmt::Display;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::broker::coordinator::Coordinator;
use crate::broker::message::{BroadcastMessage, PendingResult, RpcMessage, TaskMessage};
use crate::error::CoordinatorError;

/// Subject of the broadcast sent when a process moves between states.
pub fn state_change_subject(from: impl Display, to: impl Display) -> String {
    format!("state_changed.{}.{}", from, to)
}

/// Client side of process control over a coordinator.
///
/// Launch and continue go out as task messages; play, pause, kill and status
/// are RPCs addressed to the process id.
#[derive(Clone)]
pub struct ProcessController {
    coordinator: Arc<dyn Coordinator>,
}

impl ProcessController {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    fn send_task(
        &self,
        message: TaskMessage,
        no_reply: bool,
    ) -> Result<Option<PendingResult>, CoordinatorError> {
        if no_reply {
            self.coordinator.task_send_no_reply(message)?;
            Ok(None)
        } else {
            self.coordinator.task_send(message).map(Some)
        }
    }

    /// Ask a worker to create and run a process. `None` when `no_reply`.
    pub fn launch_process(
        &self,
        process_type: &str,
        inputs: Value,
        no_reply: bool,
    ) -> Result<Option<PendingResult>, CoordinatorError> {
        tracing::debug!(process_type, "Launching process");
        self.send_task(
            TaskMessage::Launch {
                process_type: process_type.to_string(),
                inputs,
            },
            no_reply,
        )
    }

    /// Ask a worker to resume a checkpointed process. `None` when `no_reply`.
    pub fn continue_process(
        &self,
        pid: u64,
        nowait: bool,
        no_reply: bool,
    ) -> Result<Option<PendingResult>, CoordinatorError> {
        tracing::debug!(pid, nowait, "Continuing process");
        self.send_task(TaskMessage::Continue { pid, nowait }, no_reply)
    }

    pub fn play_process(&self, pid: u64) -> Result<PendingResult, CoordinatorError> {
        self.coordinator.rpc_send(&pid.to_string(), RpcMessage::Play)
    }

    pub fn pause_process(
        &self,
        pid: u64,
        msg: Option<String>,
    ) -> Result<PendingResult, CoordinatorError> {
        self.coordinator.rpc_send(&pid.to_string(), RpcMessage::Pause { msg })
    }

    pub fn kill_process(
        &self,
        pid: u64,
        msg: Option<String>,
    ) -> Result<PendingResult, CoordinatorError> {
        self.coordinator.rpc_send(&pid.to_string(), RpcMessage::Kill { msg })
    }

    pub fn process_status(&self, pid: u64) -> Result<PendingResult, CoordinatorError> {
        self.coordinator.rpc_send(&pid.to_string(), RpcMessage::Status)
    }

    pub fn broadcast_state_change(
        &self,
        pid: u64,
        from: impl Display,
        to: impl Display,
    ) -> Result<bool, CoordinatorError> {
        let message = BroadcastMessage::new(json!({ "pid": pid }))
            .with_sender(pid.to_string())
            .with_subject(state_change_subject(from, to));
        self.coordinator.broadcast_send(message)
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }
}
