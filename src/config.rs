use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::{PollOptions, SchedulerKind};

/// Stack bytes granted per unit of `DaemonConfig::recursion_limit`.
pub const STACK_BYTES_PER_FRAME: usize = 8 * 1024;

/// Settings for the daemon worker and its runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Nesting depth the daemon thread must support. Applied as the stack size
    /// of the thread hosting the daemon runtime.
    pub recursion_limit: Option<usize>,
    /// How long shutdown waits for cancelled tasks before aborting them.
    pub shutdown_grace_ms: u64,
    /// Task messages are rejected once this many processes are running.
    pub max_concurrent_tasks: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            recursion_limit: None,
            shutdown_grace_ms: 5_000,
            max_concurrent_tasks: 200,
        }
    }
}

impl DaemonConfig {
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = Some(limit);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Stack size for the daemon thread, if a recursion limit is configured.
    pub fn stack_size(&self) -> Option<usize> {
        self.recursion_limit
            .map(|limit| limit.saturating_mul(STACK_BYTES_PER_FRAME))
    }
}

/// Which batch system to talk to and how to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    pub poll_interval_ms: u64,
    /// `None` polls until the job finishes.
    pub poll_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Direct,
            poll_interval_ms: 10_000,
            poll_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(kind: SchedulerKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: self.poll_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Local,
    Ssh,
}

/// Where scheduler commands run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Required for ssh.
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Extra `-o` options passed to ssh.
    pub ssh_options: Vec<String>,
}

impl TransportConfig {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn ssh(host: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Ssh,
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ssh_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_options.push(option.into());
        self
    }
}

/// Everything a daemon, broker and scheduler factory need for one profile.
///
/// Passed explicitly; there is no process-wide profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileContext {
    pub name: String,
    pub daemon: DaemonConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

impl Default for ProfileContext {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            daemon: DaemonConfig::default(),
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ProfileContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_daemon(mut self, daemon: DaemonConfig) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}
