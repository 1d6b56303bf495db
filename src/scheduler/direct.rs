use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SchedulerError;
use crate::scheduler::parse::{parse_ps_time, split_columns};
use crate::scheduler::{
    add_missing_as_done, parse_kill_output, parse_submit_output, JobInfo, JobState, JobTemplate,
    Scheduler, SchedulerKind,
};
use crate::transport::{escape_for_bash, Transport, TransportScope};

/// Map the first character of the `ps` STAT column to a job state.
///
/// Covers the Linux and macOS letters. `?` is what macOS sometimes prints for
/// an unknown state.
pub fn map_ps_status(code: char) -> Option<JobState> {
    match code {
        'D' | 'I' | 'R' | 'S' | 'U' | 'W' => Some(JobState::Running),
        'T' => Some(JobState::Suspended),
        'X' | 'Z' => Some(JobState::Done),
        '?' => Some(JobState::Undetermined),
        _ => None,
    }
}

/// Runs jobs directly on the target machine, bypassing any batch system.
///
/// The job id is the PID of the background `bash` process.
pub struct DirectScheduler {
    transport: Arc<dyn Transport>,
}

impl DirectScheduler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// `ps` invocation listing the given jobs (or all jobs of `user`).
    pub fn joblist_command(jobs: Option<&[String]>, user: Option<&str>) -> String {
        // -x includes processes without a controlling terminal, which is how
        // transports start detached jobs.
        let mut command = "ps -xo pid,stat,user,time".to_string();

        if let Some(jobs) = jobs {
            let ids: Vec<String> = jobs
                .iter()
                .filter(|job| !job.is_empty())
                .map(|job| escape_for_bash(job))
                .collect();
            if !ids.is_empty() {
                command.push(' ');
                command.push_str(&ids.join(" "));
            }
        } else if let Some(user) = user {
            command.push_str(&format!(" -U {}", escape_for_bash(user)));
        }

        command.push_str("| tail -n +2");
        command
    }

    /// Parse `ps -xo pid,stat,user,time` output (header already stripped).
    pub fn parse_joblist_output(
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Result<Vec<JobInfo>, SchedulerError> {
        if !stderr.trim().is_empty() {
            tracing::warn!(stderr, "Non-empty stderr while listing direct jobs");
            if exit_code != 0 {
                return Err(SchedulerError::CommandFailed {
                    operation: "direct job listing",
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                });
            }
        }

        let mut jobs = Vec::new();
        for line in stdout.lines() {
            let columns = split_columns(line);
            if columns.is_empty() || columns[0] == "PID" {
                continue;
            }
            if columns.len() < 3 {
                return Err(SchedulerError::MalformedOutput(format!(
                    "not enough fields in line '{}'",
                    line
                )));
            }

            let mut job = JobInfo::new(columns[0], JobState::Undetermined);
            job.raw_state = Some(columns[1].to_string());

            match columns[1].chars().next() {
                Some(code) => match map_ps_status(code) {
                    Some(state) => job.job_state = state,
                    None => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            job_state = %code,
                            "Unrecognized job_state"
                        );
                    }
                },
                None => tracing::debug!(job_id = %job.job_id, "No 'job_state' field"),
            }

            job.job_owner = Some(columns[2].to_string());

            if let Some(time) = columns.get(3) {
                match parse_ps_time(time) {
                    Ok(seconds) => job.wallclock_time_seconds = Some(seconds),
                    Err(e) => tracing::warn!(
                        job_id = %job.job_id,
                        error = %e,
                        "Error parsing wallclock time"
                    ),
                }
            }

            jobs.push(job);
        }
        Ok(jobs)
    }

    /// All descendants of `pid` according to `ps -eo pid=,ppid=` output.
    pub fn descendants(pid: u32, process_table: &str) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for line in process_table.lines() {
            let columns = split_columns(line);
            if columns.len() < 2 {
                continue;
            }
            if let (Ok(child), Ok(parent)) = (columns[0].parse::<u32>(), columns[1].parse::<u32>()) {
                children.entry(parent).or_default().push(child);
            }
        }

        let mut found = Vec::new();
        let mut stack = vec![pid];
        while let Some(current) = stack.pop() {
            if let Some(kids) = children.get(&current) {
                for &kid in kids {
                    if kid != pid && !found.contains(&kid) {
                        found.push(kid);
                        stack.push(kid);
                    }
                }
            }
        }
        found
    }
}

#[async_trait]
impl Scheduler for DirectScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Direct
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn accepts_memory_per_machine(&self) -> bool {
        false
    }

    fn can_query_by_user(&self) -> bool {
        true
    }

    fn submit_script_header(&self, template: &JobTemplate) -> Result<Vec<String>, SchedulerError> {
        let mut lines = Vec::new();

        if let Some(output) = &template.sched_output_path {
            lines.push(format!("exec > {}", output));
        }

        if template.sched_join_files {
            if template.sched_error_path.is_some() {
                tracing::info!("sched_join_files is set, ignoring sched_error_path");
            }
        } else if let Some(error) = &template.sched_error_path {
            lines.push(format!("exec 2> {}", error));
        } else {
            lines.push("exec 2>&1".to_string());
        }

        if template.max_memory_kb.is_some() {
            tracing::warn!("Physical memory limiting is not supported by the direct scheduler");
        }
        if template.max_wallclock_seconds.is_some() {
            tracing::warn!("Wallclock limiting is not supported by the direct scheduler");
        }

        if !template.import_sys_environment {
            lines.push("env --ignore-environment \\".to_string());
        }

        if let Some(custom) = &template.custom_scheduler_commands {
            lines.push(custom.clone());
        }

        if let Some(cores) = template
            .job_resource
            .as_ref()
            .and_then(|resource| resource.num_cores_per_mpiproc)
        {
            lines.push(format!("export OMP_NUM_THREADS={}", cores));
        }

        if template.rerunnable {
            tracing::warn!("The 'rerunnable' option has no effect with the direct scheduler");
        }

        Ok(lines)
    }

    async fn submit_job(
        &self,
        working_directory: &str,
        filename: &str,
    ) -> Result<String, SchedulerError> {
        let command = format!("bash {} > /dev/null 2>&1 & echo $!", escape_for_bash(filename));
        tracing::info!(command = %command, working_directory, "Submitting direct job");

        let output = self
            .transport
            .exec_command_wait(&command, Some(working_directory))
            .await?;
        parse_submit_output(
            &self.transport.describe(),
            output.exit_code,
            &output.stdout,
            &output.stderr,
        )
    }

    async fn get_jobs(
        &self,
        jobs: Option<&[String]>,
        user: Option<&str>,
    ) -> Result<Vec<JobInfo>, SchedulerError> {
        let command = Self::joblist_command(jobs, user);
        let output = {
            let _scope = TransportScope::enter(self.transport.as_ref())?;
            self.transport.exec_command_wait(&command, None).await?
        };

        let mut list = Self::parse_joblist_output(output.exit_code, &output.stdout, &output.stderr)?;
        add_missing_as_done(&mut list, jobs);
        Ok(list)
    }

    async fn kill_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let pid: u32 = job_id
            .trim()
            .parse()
            .map_err(|_| SchedulerError::InvalidQuery(format!("'{}' is not a valid PID", job_id)))?;

        let table = self.transport.exec_command_wait("ps -eo pid=,ppid=", None).await?;
        let mut pids = vec![pid];
        if table.success() {
            pids.extend(Self::descendants(pid, &table.stdout));
        } else {
            tracing::warn!(job_id, stderr = %table.stderr, "Could not list descendant processes");
        }

        let ids: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
        let command = format!("kill {}", ids.join(" "));
        tracing::info!(job_id, command = %command, "Killing direct job");

        let output = self.transport.exec_command_wait(&command, None).await?;
        Ok(parse_kill_output(
            &self.transport.describe(),
            output.exit_code,
            &output.stdout,
            &output.stderr,
        ))
    }
}
