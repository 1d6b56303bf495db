use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CoordinatorError, DeliveryError, SubscriberError};

/// Work handed to exactly one task subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Create a new process of `process_type` and run it.
    Launch { process_type: String, inputs: Value },
    /// Resume the process checkpointed under `pid`.
    Continue { pid: u64, nowait: bool },
    Custom(Value),
}

/// Control message addressed to one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RpcMessage {
    Play,
    Pause { msg: Option<String> },
    Kill { msg: Option<String> },
    Status,
    Custom(Value),
}

/// Fan-out notification, filtered per subscriber by subject and sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub body: Value,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub correlation_id: Option<String>,
}

impl BroadcastMessage {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

pub type TaskHandler = Arc<dyn Fn(&TaskMessage) -> Result<Value, SubscriberError> + Send + Sync>;
pub type RpcHandler = Arc<dyn Fn(&RpcMessage) -> Result<Value, SubscriberError> + Send + Sync>;
pub type BroadcastHandler = Arc<dyn Fn(&BroadcastMessage) -> Result<(), SubscriberError> + Send + Sync>;

/// Subject globs and exact senders a broadcast subscriber listens to.
///
/// An empty list on either side matches everything on that side.
#[derive(Debug, Clone, Default)]
pub struct BroadcastFilter {
    subjects: Vec<Regex>,
    senders: Vec<String>,
}

impl BroadcastFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject pattern. `*` matches any run of characters, dots included.
    pub fn with_subject(mut self, pattern: &str) -> Result<Self, CoordinatorError> {
        let source = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        let regex = Regex::new(&source).map_err(|e| CoordinatorError::InvalidFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.subjects.push(regex);
        Ok(self)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.senders.push(sender.into());
        self
    }

    pub fn matches(&self, message: &BroadcastMessage) -> bool {
        let subject_ok = self.subjects.is_empty()
            || message
                .subject
                .as_deref()
                .is_some_and(|subject| self.subjects.iter().any(|re| re.is_match(subject)));
        let sender_ok = self.senders.is_empty()
            || message
                .sender
                .as_deref()
                .is_some_and(|sender| self.senders.iter().any(|s| s == sender));
        subject_ok && sender_ok
    }
}

pub type DeliveryResult = Result<Value, DeliveryError>;

/// Deferred outcome of a task or RPC send, resolved exactly once.
///
/// Await it from async code or call [`PendingResult::blocking_wait`] from a
/// plain thread.
#[derive(Debug)]
pub struct PendingResult {
    receiver: oneshot::Receiver<DeliveryResult>,
}

impl PendingResult {
    pub(crate) fn channel() -> (oneshot::Sender<DeliveryResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    /// A result that is already resolved.
    pub fn resolved(result: DeliveryResult) -> Self {
        let (sender, pending) = Self::channel();
        // The receiver is alive, so the send cannot fail.
        let _ = sender.send(result);
        pending
    }

    /// Block the current thread until the result is available.
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_wait(self) -> DeliveryResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(DeliveryError::Dropped))
    }

    /// The result if it has been resolved, without waiting.
    pub fn try_result(&mut self) -> Option<DeliveryResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeliveryError::Dropped)),
        }
    }
}

impl Future for PendingResult {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DeliveryError::Dropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(subject: Option<&str>, sender: Option<&str>) -> BroadcastMessage {
        BroadcastMessage {
            body: Value::Null,
            subject: subject.map(str::to_string),
            sender: sender.map(str::to_string),
            correlation_id: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = BroadcastFilter::new();
        assert!(filter.matches(&message(None, None)));
        assert!(filter.matches(&message(Some("anything"), Some("42"))));
    }

    #[test]
    fn subject_glob() {
        let filter = BroadcastFilter::new()
            .with_subject("state_changed.*.finished")
            .unwrap();
        assert!(filter.matches(&message(Some("state_changed.running.finished"), None)));
        assert!(!filter.matches(&message(Some("state_changed.running.killed"), None)));
        assert!(!filter.matches(&message(None, None)));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let filter = BroadcastFilter::new().with_subject("a.b").unwrap();
        assert!(filter.matches(&message(Some("a.b"), None)));
        assert!(!filter.matches(&message(Some("axb"), None)));
    }

    #[test]
    fn sender_is_exact_match() {
        let filter = BroadcastFilter::new().with_sender("7");
        assert!(filter.matches(&message(Some("x"), Some("7"))));
        assert!(!filter.matches(&message(Some("x"), Some("77"))));
        assert!(!filter.matches(&message(Some("x"), None)));
    }

    #[test]
    fn task_message_json_shape() {
        let msg = TaskMessage::Continue { pid: 3, nowait: false };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "continue", "payload": {"pid": 3, "nowait": false}})
        );
    }

    #[test]
    fn resolved_result_is_immediately_available() {
        let mut pending = PendingResult::resolved(Ok(json!(1)));
        assert_eq!(pending.try_result().unwrap().unwrap(), json!(1));
    }

    #[test]
    fn dropped_sender_resolves_to_dropped() {
        let (sender, pending) = PendingResult::channel();
        drop(sender);
        assert!(matches!(pending.blocking_wait(), Err(DeliveryError::Dropped)));
    }
}
