use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::transport::{escape_for_bash, CommandOutput, ScopeDepth, Transport};

/// Runs commands on a remote host through the system `ssh` client.
///
/// Authentication and host key policy are left to the user's ssh
/// configuration. Commands are refused unless at least one scope is open.
#[derive(Debug)]
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    options: Vec<String>,
    depth: ScopeDepth,
}

impl SshTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            options: vec!["BatchMode=yes".to_string()],
            depth: ScopeDepth::default(),
        }
    }

    pub fn from_config(host: impl Into<String>, config: &TransportConfig) -> Self {
        let mut transport = Self::new(host);
        transport.user = config.user.clone();
        transport.port = config.port;
        transport.options.extend(config.ssh_options.iter().cloned());
        transport
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Build the argument vector passed to `ssh`.
    pub fn ssh_args(&self, command: &str, workdir: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination());

        let remote = match workdir {
            Some(dir) => format!("cd {} && {}", escape_for_bash(dir), command),
            None => command.to_string(),
        };
        args.push(remote);
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        format!("ssh://{}", self.destination())
    }

    fn enter(&self) -> Result<(), TransportError> {
        if self.depth.enter() == 1 {
            tracing::debug!(host = %self.host, "Opened ssh transport scope");
        }
        Ok(())
    }

    fn exit(&self) {
        if self.depth.exit() == 0 {
            tracing::debug!(host = %self.host, "Closed ssh transport scope");
        }
    }

    fn is_open(&self) -> bool {
        self.depth.get() > 0
    }

    async fn exec_command_wait(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen(self.describe()));
        }

        let output = Command::new("ssh")
            .args(self.ssh_args(command, workdir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                command: command.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
