use crate::scheduler::parse::format_walltime;
use crate::scheduler::pbs::{PbsDialect, ResourceLimits};
use crate::scheduler::SchedulerKind;

/// PBS Pro uses a `select=` chunk plus a separate walltime line.
#[derive(Debug, Clone, Copy, Default)]
pub struct PbsPro;

impl PbsDialect for PbsPro {
    const KIND: SchedulerKind = SchedulerKind::Pbspro;

    fn resource_lines(limits: &ResourceLimits) -> Vec<String> {
        let mut lines = Vec::new();

        let mut select = format!("select={}", limits.num_machines);
        if let Some(procs) = limits.num_mpiprocs_per_machine {
            select.push_str(&format!(":mpiprocs={}", procs));
        }
        if let Some(cores) = limits.num_cores_per_machine {
            select.push_str(&format!(":ncpus={}", cores));
        }

        if let Some(seconds) = limits.max_wallclock_seconds {
            lines.push(format!("#PBS -l walltime={}", format_walltime(seconds)));
        }
        if let Some(kb) = limits.max_memory_kb {
            select.push_str(&format!(":mem={}kb", kb));
        }

        lines.push(format!("#PBS -l {}", select));
        lines
    }
}
