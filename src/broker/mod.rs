//! In-process message broker.
//!
//! The [`Coordinator`] routes three kinds of traffic:
//!
//! - **tasks**: offered to task subscribers in registration order until one
//!   accepts; the sender gets a [`PendingResult`]
//! - **rpc**: delivered to the one subscriber registered under the recipient id
//! - **broadcasts**: fanned out to every subscriber whose filter matches
//!
//! Nothing is persisted. A task that nobody takes is reported to the sender,
//! never queued.

pub mod controller;
pub mod coordinator;
pub mod message;

use std::sync::Arc;

use crate::config::ProfileContext;

pub use controller::{state_change_subject, ProcessController};
pub use coordinator::{Coordinator, InMemoryCoordinator};
pub use message::{
    BroadcastFilter, BroadcastHandler, BroadcastMessage, PendingResult, RpcHandler, RpcMessage,
    TaskHandler, TaskMessage,
};

/// Which registry a subscriber lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    Task,
    Rpc,
    Broadcast,
}

impl std::fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberKind::Task => write!(f, "task"),
            SubscriberKind::Rpc => write!(f, "rpc"),
            SubscriberKind::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Broker connection of one profile.
pub trait Broker: Send + Sync {
    fn coordinator(&self) -> Arc<dyn Coordinator>;

    fn controller(&self) -> ProcessController {
        ProcessController::new(self.coordinator())
    }

    /// Tasks waiting in the broker's queue.
    fn iterate_tasks(&self) -> Vec<TaskMessage>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Broker backed by an [`InMemoryCoordinator`]. Keeps no task queue.
pub struct InMemoryBroker {
    profile: String,
    coordinator: Arc<InMemoryCoordinator>,
}

impl InMemoryBroker {
    pub fn new(profile: &ProfileContext) -> Self {
        tracing::debug!(profile = %profile.name, "Created in-memory broker");
        Self {
            profile: profile.name.clone(),
            coordinator: Arc::new(InMemoryCoordinator::new()),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }
}

impl Broker for InMemoryBroker {
    fn coordinator(&self) -> Arc<dyn Coordinator> {
        self.coordinator.clone()
    }

    fn iterate_tasks(&self) -> Vec<TaskMessage> {
        Vec::new()
    }

    fn close(&self) {
        if !self.coordinator.is_closed() {
            tracing::info!(profile = %self.profile, "Closing broker");
        }
        self.coordinator.close();
    }

    fn is_closed(&self) -> bool {
        self.coordinator.is_closed()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("profile", &self.profile)
            .field("closed", &self.coordinator.is_closed())
            .finish()
    }
}
