use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, ProcessController};
use crate::config::{DaemonConfig, ProfileContext};
use crate::daemon::launcher::ProcessLauncher;
use crate::daemon::loader::{LoadContext, ObjectLoader};
use crate::daemon::persistence::Persister;
use crate::daemon::runner::Runner;
use crate::error::DaemonError;
use crate::transport::create_transport;

/// A daemon worker: a runner plus the launcher subscribed to the broker.
pub struct DaemonWorker {
    profile: Arc<ProfileContext>,
    runner: Runner,
    launcher_id: String,
}

impl DaemonWorker {
    /// Build the runner and register the process launcher as task subscriber.
    ///
    /// Must be called from within a tokio runtime. Failures are logged before
    /// they are returned.
    pub fn start(
        profile: Arc<ProfileContext>,
        broker: Arc<dyn Broker>,
        persister: Arc<dyn Persister>,
        loader: ObjectLoader,
    ) -> Result<Self, DaemonError> {
        let result = Self::try_start(profile, broker, persister, loader);
        if let Err(e) = &result {
            tracing::error!(error = %e, "Daemon worker failed to start");
        }
        result
    }

    fn try_start(
        profile: Arc<ProfileContext>,
        broker: Arc<dyn Broker>,
        persister: Arc<dyn Persister>,
        loader: ObjectLoader,
    ) -> Result<Self, DaemonError> {
        let transport = create_transport(&profile.transport)
            .map_err(|e| DaemonError::Startup(e.to_string()))?;
        let runner = Runner::new(broker.clone(), persister.clone(), &profile.daemon)?;

        let load_context = LoadContext {
            profile: profile.clone(),
            transport,
        };
        let launcher = ProcessLauncher::new(runner.clone(), persister, load_context, loader);
        let launcher_id = broker
            .coordinator()
            .add_task_subscriber(launcher.into_subscriber(), None)?;

        tracing::info!(
            profile = %profile.name,
            subscriber = %launcher_id,
            max_tasks = profile.daemon.max_concurrent_tasks,
            "Daemon worker started"
        );

        Ok(Self {
            profile,
            runner,
            launcher_id,
        })
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn controller(&self) -> ProcessController {
        self.runner.broker().controller()
    }

    pub fn profile(&self) -> &ProfileContext {
        &self.profile
    }

    /// Serve until `shutdown` is cancelled, then shut down.
    pub async fn run(self, shutdown: CancellationToken) {
        shutdown.cancelled().await;
        tracing::info!("Received signal to shut down the daemon worker");
        self.shutdown().await;
    }

    /// Stop taking tasks, cancel the running ones and close the broker.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .runner
            .broker()
            .coordinator()
            .remove_task_subscriber(&self.launcher_id)
        {
            tracing::debug!(error = %e, "Launcher was already unsubscribed");
        }
        self.runner.shutdown().await;
        tracing::info!("Daemon worker stopped");
    }
}

/// Run `f` on a dedicated thread hosting a current-thread runtime.
///
/// The thread's stack is sized from `config.recursion_limit` when set.
pub fn run_daemon_thread<F, Fut, T>(config: &DaemonConfig, f: F) -> Result<T, DaemonError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T>,
    T: Send + 'static,
{
    let mut builder = std::thread::Builder::new().name("procflow-daemon".to_string());
    if let Some(stack_size) = config.stack_size() {
        tracing::info!(
            recursion_limit = ?config.recursion_limit,
            stack_size,
            "Applying recursion limit to the daemon thread"
        );
        builder = builder.stack_size(stack_size);
    }

    let thread = builder
        .spawn(move || -> Result<T, DaemonError> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DaemonError::NoRuntime(e.to_string()))?;
            Ok(runtime.block_on(f()))
        })
        .map_err(|e| DaemonError::Startup(e.to_string()))?;

    thread
        .join()
        .map_err(|_| DaemonError::Startup("daemon thread panicked".to_string()))?
}
