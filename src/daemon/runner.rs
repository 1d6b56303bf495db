use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, ProcessController, RpcHandler, RpcMessage};
use crate::config::DaemonConfig;
use crate::daemon::persistence::{Checkpoint, Persister};
use crate::daemon::process::{Process, ProcessContext, ProcessState};
use crate::error::{DaemonError, ProcessError, SubscriberError};

struct RunnerInner {
    broker: Arc<dyn Broker>,
    persister: Arc<dyn Persister>,
    handle: Handle,
    root: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    max_tasks: usize,
    grace: Duration,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// Owns the daemon's in-flight tasks and the broker connection.
///
/// Cheap to clone; clones share the same task registry. Tasks are spawned on
/// the runtime the runner was created in, so `spawn` may be called from any
/// thread (coordinator handlers run on the sender's thread).
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Must be called from within a tokio runtime.
    pub fn new(
        broker: Arc<dyn Broker>,
        persister: Arc<dyn Persister>,
        config: &DaemonConfig,
    ) -> Result<Self, DaemonError> {
        let handle = Handle::try_current().map_err(|e| DaemonError::NoRuntime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(RunnerInner {
                broker,
                persister,
                handle,
                root: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
                max_tasks: config.max_concurrent_tasks,
                grace: config.shutdown_grace(),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn max_tasks(&self) -> usize {
        self.inner.max_tasks
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.len()
    }

    /// True once shutdown has started.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst) || self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Schedule a task. `f` receives the task's own cancellation token.
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> Result<(), DaemonError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_capacity()?;
        let token = self.inner.root.child_token();
        self.spawn_task(name, f(token))
    }

    fn ensure_capacity(&self) -> Result<(), DaemonError> {
        if self.is_closing() {
            return Err(DaemonError::RunnerClosed);
        }
        if self.task_count() >= self.inner.max_tasks {
            return Err(DaemonError::AtCapacity(self.inner.max_tasks));
        }
        Ok(())
    }

    fn spawn_task<Fut>(&self, name: &str, future: Fut) -> Result<(), DaemonError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        if self.is_closing() {
            return Err(DaemonError::RunnerClosed);
        }
        tasks.spawn_on(future, &self.inner.handle);
        tracing::debug!(task = name, count = tasks.len(), "Task scheduled");
        Ok(())
    }

    /// Run `process` to completion as a runner task.
    ///
    /// The process answers RPCs under its pid while it runs. Its outcome is
    /// saved through the persister and announced as a state change broadcast.
    /// A process interrupted by [`Runner::shutdown`] is saved as `Waiting`
    /// and can be continued by a later daemon.
    pub fn spawn_process(
        &self,
        process: Box<dyn Process>,
        checkpoint: Checkpoint,
    ) -> Result<u64, DaemonError> {
        self.ensure_capacity()?;

        let pid = process.pid();
        let token = self.inner.root.child_token();
        let kill = CancellationToken::new();
        let coordinator = self.inner.broker.coordinator();
        let rpc_id = coordinator.add_rpc_subscriber(
            rpc_handler(pid, token.clone(), kill.clone()),
            Some(pid.to_string()),
        )?;

        let ctx = ProcessContext {
            pid,
            cancel: token,
            kill,
            controller: self.inner.broker.controller(),
        };
        let persister = self.inner.persister.clone();
        let future = drive_process(process, checkpoint, ctx, persister);

        if let Err(e) = self.spawn_task(&format!("process-{}", pid), future) {
            let _ = coordinator.remove_rpc_subscriber(&rpc_id);
            return Err(e);
        }
        Ok(pid)
    }

    /// Close the runner and its broker. Only the first call has an effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.broker.close();
        tracing::info!("Runner closed");
    }

    /// Cancel every task, wait up to the grace period, abort the rest and close.
    ///
    /// Processes see a cancellation that is not a kill, so they stop without
    /// tearing down their remote work. Task errors and panics are logged,
    /// never propagated.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            self.close();
            return;
        }

        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        tracing::info!(count = tasks.len(), "Cancelling scheduled tasks");
        self.inner.root.cancel();

        let drained = tokio::time::timeout(self.inner.grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_ms = self.inner.grace.as_millis() as u64,
                "Grace period elapsed, aborting remaining tasks"
            );
            tasks.abort_all();
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        }

        self.close();
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => tracing::debug!("Task aborted"),
        Err(e) => tracing::error!(error = %e, "Task panicked"),
    }
}

fn rpc_handler(pid: u64, token: CancellationToken, kill: CancellationToken) -> RpcHandler {
    Arc::new(move |message: &RpcMessage| -> Result<Value, SubscriberError> {
        match message {
            RpcMessage::Kill { msg } => {
                tracing::info!(pid, msg = ?msg, "Kill requested");
                kill.cancel();
                token.cancel();
                Ok(Value::Bool(true))
            }
            RpcMessage::Status => {
                let state = if kill.is_cancelled() {
                    "killing"
                } else if token.is_cancelled() {
                    "stopping"
                } else {
                    "running"
                };
                Ok(json!({ "pid": pid, "state": state }))
            }
            RpcMessage::Play => Ok(Value::Bool(true)),
            RpcMessage::Pause { .. } => {
                tracing::debug!(pid, "Pause is not supported for daemon processes");
                Ok(Value::Bool(false))
            }
            RpcMessage::Custom(_) => Err(SubscriberError::failed(format!(
                "process {} does not handle custom messages",
                pid
            ))),
        }
    })
}

async fn drive_process(
    process: Box<dyn Process>,
    mut checkpoint: Checkpoint,
    ctx: ProcessContext,
    persister: Arc<dyn Persister>,
) {
    let pid = ctx.pid;
    let controller = ctx.controller.clone();
    let previous = checkpoint.state;

    checkpoint.transition(ProcessState::Running);
    if let Err(e) = persister.save_checkpoint(&checkpoint) {
        tracing::warn!(pid, error = %e, "Failed to save running checkpoint");
    }
    announce(&controller, pid, previous, ProcessState::Running);
    tracing::info!(pid, process_type = %checkpoint.process_type, "Process running");

    let outcome = process.step_until_terminated(ctx).await;

    let state = match outcome {
        Ok(outputs) => {
            checkpoint.outputs = Some(outputs);
            checkpoint.resume = None;
            ProcessState::Finished
        }
        Err(ProcessError::Killed(msg)) => {
            checkpoint.error = Some(msg);
            ProcessState::Killed
        }
        Err(ProcessError::Interrupted { reason, resume }) => {
            tracing::info!(pid, reason = %reason, "Process interrupted, left for continuation");
            checkpoint.resume = resume;
            ProcessState::Waiting
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "Process excepted");
            checkpoint.error = Some(e.to_string());
            ProcessState::Excepted
        }
    };
    checkpoint.transition(state);

    if let Err(e) = persister.save_checkpoint(&checkpoint) {
        tracing::error!(pid, error = %e, "Failed to save final checkpoint");
    }
    announce(&controller, pid, ProcessState::Running, state);
    if let Err(e) = controller.coordinator().remove_rpc_subscriber(&pid.to_string()) {
        tracing::debug!(pid, error = %e, "Could not remove process rpc subscriber");
    }
    tracing::info!(pid, state = %state, "Process left the runner");
}

fn announce(controller: &ProcessController, pid: u64, from: ProcessState, to: ProcessState) {
    if let Err(e) = controller.broadcast_state_change(pid, from, to) {
        tracing::debug!(pid, error = %e, "State change not broadcast");
    }
}
