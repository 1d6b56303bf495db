use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::resource::JobResource;

pub const DEFAULT_SHEBANG: &str = "#!/bin/bash";

/// Everything a scheduler needs to render a submission script.
///
/// Only the fields a backend understands end up in its header; unsupported
/// directives are logged and skipped by the backend. Fields missing from a
/// JSON template take the values of [`JobTemplate::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub shebang: Option<String>,
    pub working_directory: Option<String>,
    pub job_name: Option<String>,
    pub sched_output_path: Option<String>,
    pub sched_error_path: Option<String>,
    pub sched_join_files: bool,
    pub import_sys_environment: bool,
    pub custom_scheduler_commands: Option<String>,
    pub max_wallclock_seconds: Option<i64>,
    pub max_memory_kb: Option<i64>,
    pub job_resource: Option<JobResource>,
    pub rerunnable: bool,
    pub submit_as_hold: bool,
    pub queue_name: Option<String>,
    pub account: Option<String>,
    pub priority: Option<String>,
    pub email: Option<String>,
    pub email_on_started: bool,
    pub email_on_terminated: bool,
    pub job_environment: BTreeMap<String, String>,
    pub prepend_text: Option<String>,
    pub append_text: Option<String>,
    /// Caller payload, emitted after the header.
    pub codes_run_lines: Vec<String>,
}

/// Imports the submitting environment; every other option is off.
impl Default for JobTemplate {
    fn default() -> Self {
        Self {
            shebang: None,
            working_directory: None,
            job_name: None,
            sched_output_path: None,
            sched_error_path: None,
            sched_join_files: false,
            import_sys_environment: true,
            custom_scheduler_commands: None,
            max_wallclock_seconds: None,
            max_memory_kb: None,
            job_resource: None,
            rerunnable: false,
            submit_as_hold: false,
            queue_name: None,
            account: None,
            priority: None,
            email: None,
            email_on_started: false,
            email_on_terminated: false,
            job_environment: BTreeMap::new(),
            prepend_text: None,
            append_text: None,
            codes_run_lines: Vec::new(),
        }
    }
}

impl JobTemplate {
    pub fn new(codes_run_lines: Vec<String>) -> Self {
        Self {
            codes_run_lines,
            ..Default::default()
        }
    }

    pub fn with_resource(mut self, resource: JobResource) -> Self {
        self.job_resource = Some(resource);
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn with_wallclock_seconds(mut self, seconds: i64) -> Self {
        self.max_wallclock_seconds = Some(seconds);
        self
    }

    pub fn with_memory_kb(mut self, kb: i64) -> Self {
        self.max_memory_kb = Some(kb);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job_environment.insert(key.into(), value.into());
        self
    }

    pub fn shebang(&self) -> &str {
        self.shebang.as_deref().unwrap_or(DEFAULT_SHEBANG)
    }
}
