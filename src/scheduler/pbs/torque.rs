use crate::scheduler::parse::format_walltime;
use crate::scheduler::pbs::{PbsDialect, ResourceLimits};
use crate::scheduler::SchedulerKind;

/// Torque spells everything on one `nodes=` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Torque;

impl PbsDialect for Torque {
    const KIND: SchedulerKind = SchedulerKind::Torque;

    fn resource_lines(limits: &ResourceLimits) -> Vec<String> {
        let mut select = format!("nodes={}", limits.num_machines);
        // ppn counts cores when known, MPI processes otherwise.
        if let Some(cores) = limits.num_cores_per_machine {
            select.push_str(&format!(":ppn={}", cores));
        } else if let Some(procs) = limits.num_mpiprocs_per_machine {
            select.push_str(&format!(":ppn={}", procs));
        }

        if let Some(seconds) = limits.max_wallclock_seconds {
            select.push_str(&format!(",walltime={}", format_walltime(seconds)));
        }
        if let Some(kb) = limits.max_memory_kb {
            select.push_str(&format!(",mem={}kb", kb));
        }

        vec![format!("#PBS -l {}", select)]
    }
}
