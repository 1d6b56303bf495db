//! Remote command execution used by the schedulers.
//!
//! A [`Transport`] runs a shell command on the compute resource and returns its
//! exit code together with the captured stdout and stderr. Schedulers treat the
//! transport as already open; batches of calls are wrapped in a
//! [`TransportScope`] so the scope is released on every exit path, including
//! parse failures.
//!
//! # Implementations
//!
//! - [`LocalTransport`]: runs `bash -c <command>` on this machine
//! - [`SshTransport`]: runs the command through the system `ssh` client

pub mod local;
pub mod ssh;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{TransportConfig, TransportKind};
use crate::error::TransportError;

pub use local::LocalTransport;
pub use ssh::SshTransport;

/// Exit code, stdout and stderr of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short human readable description used in log lines.
    fn describe(&self) -> String;

    /// Enter a connection scope. Scopes nest; the connection stays open until
    /// the outermost scope exits.
    fn enter(&self) -> Result<(), TransportError>;

    /// Leave a connection scope entered with [`Transport::enter`].
    fn exit(&self);

    fn is_open(&self) -> bool;

    /// Run `command` (optionally inside `workdir`) and wait for it to finish.
    async fn exec_command_wait(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, TransportError>;
}

/// RAII guard for a transport connection scope.
pub struct TransportScope<'a> {
    transport: &'a dyn Transport,
}

impl<'a> TransportScope<'a> {
    pub fn enter(transport: &'a dyn Transport) -> Result<Self, TransportError> {
        transport.enter()?;
        Ok(Self { transport })
    }
}

impl Drop for TransportScope<'_> {
    fn drop(&mut self) {
        self.transport.exit();
    }
}

/// Nesting counter shared by the transport implementations.
#[derive(Debug, Default)]
pub(crate) struct ScopeDepth(AtomicUsize);

impl ScopeDepth {
    pub(crate) fn enter(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn exit(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build the transport described by `config`.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config.kind {
        TransportKind::Local => Ok(Arc::new(LocalTransport::new())),
        TransportKind::Ssh => {
            let host = config.host.as_deref().ok_or(TransportError::MissingHost)?;
            Ok(Arc::new(SshTransport::from_config(host, config)))
        }
    }
}

/// Quote `value` for safe interpolation into a bash command line.
pub fn escape_for_bash(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}
