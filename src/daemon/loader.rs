use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProfileContext;
use crate::daemon::calcjob::{CalcJobProcess, CALCJOB_PROCESS_TYPE};
use crate::daemon::persistence::Checkpoint;
use crate::daemon::process::Process;
use crate::error::ProcessError;
use crate::transport::Transport;

/// Shared resources handed to process constructors.
#[derive(Clone)]
pub struct LoadContext {
    pub profile: Arc<ProfileContext>,
    pub transport: Arc<dyn Transport>,
}

pub type ProcessFactory =
    Arc<dyn Fn(&Checkpoint, &LoadContext) -> Result<Box<dyn Process>, ProcessError> + Send + Sync>;

/// Maps process type names to constructors.
#[derive(Clone, Default)]
pub struct ObjectLoader {
    factories: HashMap<String, ProcessFactory>,
}

impl ObjectLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that knows the process types shipped with the crate.
    pub fn with_builtin() -> Self {
        Self::new().with_factory(CALCJOB_PROCESS_TYPE, CalcJobProcess::factory())
    }

    pub fn with_factory(mut self, process_type: impl Into<String>, factory: ProcessFactory) -> Self {
        self.factories.insert(process_type.into(), factory);
        self
    }

    pub fn knows(&self, process_type: &str) -> bool {
        self.factories.contains_key(process_type)
    }

    /// Rebuild the process stored in `checkpoint`.
    pub fn load(
        &self,
        checkpoint: &Checkpoint,
        context: &LoadContext,
    ) -> Result<Box<dyn Process>, ProcessError> {
        let factory = self
            .factories
            .get(&checkpoint.process_type)
            .ok_or_else(|| ProcessError::UnknownType(checkpoint.process_type.clone()))?;
        factory(checkpoint, context)
    }
}
