use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use uuid::Uuid;

use crate::broker::message::{
    BroadcastFilter, BroadcastHandler, BroadcastMessage, PendingResult, RpcHandler, RpcMessage,
    TaskHandler, TaskMessage,
};
use crate::broker::SubscriberKind;
use crate::error::{CoordinatorError, DeliveryError, SubscriberError};

/// Routes task, RPC and broadcast traffic between subscribers.
///
/// Handlers run synchronously on the sending thread. Every method apart from
/// `close` and `is_closed` fails with [`CoordinatorError::Closed`] once the
/// coordinator is closed.
pub trait Coordinator: Send + Sync {
    fn add_task_subscriber(
        &self,
        handler: TaskHandler,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError>;

    fn remove_task_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError>;

    fn add_rpc_subscriber(
        &self,
        handler: RpcHandler,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError>;

    fn remove_rpc_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError>;

    fn add_broadcast_subscriber(
        &self,
        handler: BroadcastHandler,
        filter: BroadcastFilter,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError>;

    fn remove_broadcast_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError>;

    /// Offer `message` to the task subscribers in registration order.
    ///
    /// The first subscriber that does not reject takes it. When nobody takes
    /// it the returned result resolves to [`DeliveryError::NoTaker`].
    fn task_send(&self, message: TaskMessage) -> Result<PendingResult, CoordinatorError>;

    /// Like [`Coordinator::task_send`] but the outcome is only logged.
    fn task_send_no_reply(&self, message: TaskMessage) -> Result<(), CoordinatorError>;

    fn rpc_send(
        &self,
        recipient_id: &str,
        message: RpcMessage,
    ) -> Result<PendingResult, CoordinatorError>;

    /// Deliver to every matching broadcast subscriber. Subscriber failures are
    /// logged and do not stop the fan-out.
    fn broadcast_send(&self, message: BroadcastMessage) -> Result<bool, CoordinatorError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Subscribers of one kind, in registration order.
struct Registry<H> {
    kind: SubscriberKind,
    entries: Vec<(String, H)>,
}

impl<H: Clone> Registry<H> {
    fn new(kind: SubscriberKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    fn contains(&self, identifier: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == identifier)
    }

    fn insert(&mut self, handler: H, identifier: Option<String>) -> Result<String, CoordinatorError> {
        let identifier = match identifier {
            Some(id) if self.contains(&id) => {
                return Err(CoordinatorError::Conflict {
                    kind: self.kind,
                    identifier: id,
                });
            }
            Some(id) => id,
            None => loop {
                let id = Uuid::new_v4().to_string();
                if !self.contains(&id) {
                    break id;
                }
            },
        };
        self.entries.push((identifier.clone(), handler));
        Ok(identifier)
    }

    fn remove(&mut self, identifier: &str) -> Result<(), CoordinatorError> {
        let index = self
            .entries
            .iter()
            .position(|(id, _)| id == identifier)
            .ok_or_else(|| CoordinatorError::NotFound {
                kind: self.kind,
                identifier: identifier.to_string(),
            })?;
        self.entries.remove(index);
        Ok(())
    }

    fn get(&self, identifier: &str) -> Option<H> {
        self.entries
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, handler)| handler.clone())
    }

    fn snapshot(&self) -> Vec<(String, H)> {
        self.entries.clone()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Registries {
    tasks: Registry<TaskHandler>,
    rpc: Registry<RpcHandler>,
    broadcast: Registry<(BroadcastFilter, BroadcastHandler)>,
}

/// Coordinator that delivers in-process. Nothing is persisted or queued.
pub struct InMemoryCoordinator {
    registries: Mutex<Option<Registries>>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            registries: Mutex::new(Some(Registries {
                tasks: Registry::new(SubscriberKind::Task),
                rpc: Registry::new(SubscriberKind::Rpc),
                broadcast: Registry::new(SubscriberKind::Broadcast),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Registries>> {
        self.registries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the live registries, or fail if closed.
    fn with_registries<T>(
        &self,
        f: impl FnOnce(&mut Registries) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        let mut guard = self.lock();
        let registries = guard.as_mut().ok_or(CoordinatorError::Closed)?;
        f(registries)
    }

    /// Number of registered subscribers of `kind`; zero once closed.
    pub fn subscriber_count(&self, kind: SubscriberKind) -> usize {
        self.lock().as_ref().map_or(0, |r| match kind {
            SubscriberKind::Task => r.tasks.len(),
            SubscriberKind::Rpc => r.rpc.len(),
            SubscriberKind::Broadcast => r.broadcast.len(),
        })
    }

    fn deliver_task(&self, message: &TaskMessage) -> Result<Result<Value, DeliveryError>, CoordinatorError> {
        let subscribers = self.with_registries(|r| Ok(r.tasks.snapshot()))?;

        let mut rejected = 0;
        for (identifier, handler) in &subscribers {
            match handler(message) {
                Ok(value) => {
                    tracing::debug!(subscriber = %identifier, "Task accepted");
                    return Ok(Ok(value));
                }
                Err(SubscriberError::Rejected(reason)) => {
                    tracing::debug!(subscriber = %identifier, reason = %reason, "Task rejected");
                    rejected += 1;
                }
                Err(SubscriberError::Failed(source)) => {
                    return Ok(Err(DeliveryError::SubscriberFailed {
                        subscriber: identifier.clone(),
                        source,
                    }));
                }
            }
        }

        Ok(Err(DeliveryError::NoTaker {
            subscribers: subscribers.len(),
            rejected,
        }))
    }
}

impl Coordinator for InMemoryCoordinator {
    fn add_task_subscriber(
        &self,
        handler: TaskHandler,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError> {
        self.with_registries(|r| r.tasks.insert(handler, identifier))
    }

    fn remove_task_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError> {
        self.with_registries(|r| r.tasks.remove(identifier))
    }

    fn add_rpc_subscriber(
        &self,
        handler: RpcHandler,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError> {
        self.with_registries(|r| r.rpc.insert(handler, identifier))
    }

    fn remove_rpc_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError> {
        self.with_registries(|r| r.rpc.remove(identifier))
    }

    fn add_broadcast_subscriber(
        &self,
        handler: BroadcastHandler,
        filter: BroadcastFilter,
        identifier: Option<String>,
    ) -> Result<String, CoordinatorError> {
        self.with_registries(|r| r.broadcast.insert((filter, handler), identifier))
    }

    fn remove_broadcast_subscriber(&self, identifier: &str) -> Result<(), CoordinatorError> {
        self.with_registries(|r| r.broadcast.remove(identifier))
    }

    fn task_send(&self, message: TaskMessage) -> Result<PendingResult, CoordinatorError> {
        let result = self.deliver_task(&message)?;
        Ok(PendingResult::resolved(result))
    }

    fn task_send_no_reply(&self, message: TaskMessage) -> Result<(), CoordinatorError> {
        match self.deliver_task(&message)? {
            Ok(_) => {}
            Err(e @ DeliveryError::NoTaker { .. }) => {
                tracing::warn!(error = %e, "Task was not taken by any subscriber");
            }
            Err(e) => {
                tracing::error!(error = %e, "Task subscriber failed");
            }
        }
        Ok(())
    }

    fn rpc_send(
        &self,
        recipient_id: &str,
        message: RpcMessage,
    ) -> Result<PendingResult, CoordinatorError> {
        let handler = self.with_registries(|r| {
            r.rpc
                .get(recipient_id)
                .ok_or_else(|| CoordinatorError::UnknownRecipient(recipient_id.to_string()))
        })?;

        let result = handler(&message).map_err(|e| match e {
            SubscriberError::Failed(source) => DeliveryError::SubscriberFailed {
                subscriber: recipient_id.to_string(),
                source,
            },
            rejected @ SubscriberError::Rejected(_) => DeliveryError::SubscriberFailed {
                subscriber: recipient_id.to_string(),
                source: Box::new(rejected),
            },
        });
        Ok(PendingResult::resolved(result))
    }

    fn broadcast_send(&self, message: BroadcastMessage) -> Result<bool, CoordinatorError> {
        let subscribers = self.with_registries(|r| Ok(r.broadcast.snapshot()))?;

        for (identifier, (filter, handler)) in &subscribers {
            if !filter.matches(&message) {
                continue;
            }
            if let Err(e) = handler(&message) {
                tracing::error!(
                    subscriber = %identifier,
                    subject = ?message.subject,
                    error = %e,
                    "Broadcast subscriber failed"
                );
            }
        }
        Ok(true)
    }

    fn close(&self) {
        // Handlers are dropped after the lock is released.
        let registries = self.lock().take();
        if registries.is_some() {
            tracing::debug!("Coordinator closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}
