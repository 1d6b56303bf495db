//! Daemon worker lifecycle.
//!
//! A [`DaemonWorker`] owns a [`Runner`] and registers a [`ProcessLauncher`] as
//! task subscriber on the broker. Task messages become processes that run as
//! runner tasks until they terminate or the daemon shuts down.
//!
//! # Shutdown
//!
//! 1. The launcher is unsubscribed so no new work arrives
//! 2. Every runner task is cancelled through its child token
//! 3. Tasks are awaited for the grace period; errors and panics are logged
//! 4. Remaining tasks are aborted
//! 5. The runner closes the broker, exactly once

pub mod calcjob;
pub mod launcher;
pub mod loader;
pub mod persistence;
pub mod process;
pub mod runner;
pub mod worker;

pub use calcjob::{CalcJobInputs, CalcJobProcess, CALCJOB_PROCESS_TYPE};
pub use launcher::ProcessLauncher;
pub use loader::{LoadContext, ObjectLoader, ProcessFactory};
pub use persistence::{Checkpoint, InMemoryPersister, Persister};
pub use process::{Process, ProcessContext, ProcessState};
pub use runner::Runner;
pub use worker::{run_daemon_thread, DaemonWorker};
