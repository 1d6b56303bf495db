use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::TransportError;
use crate::transport::{CommandOutput, ScopeDepth, Transport};

/// Runs commands on this machine through `bash -c`.
///
/// The local machine is always reachable, so scopes only track nesting.
#[derive(Debug, Default)]
pub struct LocalTransport {
    depth: ScopeDepth,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_output(
        command: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<CommandOutput, TransportError> {
        let output = result.map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // No exit code means the command was killed by a signal.
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::debug!(command, exit_code, "Local command finished");

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn enter(&self) -> Result<(), TransportError> {
        self.depth.enter();
        Ok(())
    }

    fn exit(&self) {
        self.depth.exit();
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn exec_command_wait(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let result = cmd.output().await;
        Self::process_output(command, result)
    }
}
