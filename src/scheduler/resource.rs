use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Parallel resources requested for a job, expressed as machines and
/// MPI processes per machine.
///
/// Build it with [`JobResource::new`]; the missing one of
/// `num_machines`, `num_mpiprocs_per_machine` and `tot_num_mpiprocs` is derived
/// from the other two. Deserialization goes through the same validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResourceRequest")]
pub struct JobResource {
    pub num_machines: u32,
    pub num_mpiprocs_per_machine: u32,
    pub num_cores_per_machine: Option<u32>,
    pub num_cores_per_mpiproc: Option<u32>,
}

/// Unvalidated resource request, as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub num_machines: Option<u32>,
    pub num_mpiprocs_per_machine: Option<u32>,
    pub tot_num_mpiprocs: Option<u32>,
    pub num_cores_per_machine: Option<u32>,
    pub num_cores_per_mpiproc: Option<u32>,
}

fn positive(name: &str, value: Option<u32>) -> Result<Option<u32>, SchedulerError> {
    match value {
        Some(0) => Err(SchedulerError::InvalidResource(format!(
            "{} must be greater than or equal to one",
            name
        ))),
        other => Ok(other),
    }
}

impl JobResource {
    pub fn new(request: &ResourceRequest) -> Result<Self, SchedulerError> {
        let machines = positive("num_machines", request.num_machines)?;
        let per_machine = positive("num_mpiprocs_per_machine", request.num_mpiprocs_per_machine)?;
        let total = positive("tot_num_mpiprocs", request.tot_num_mpiprocs)?;
        let cores_per_machine = positive("num_cores_per_machine", request.num_cores_per_machine)?;
        let cores_per_mpiproc = positive("num_cores_per_mpiproc", request.num_cores_per_mpiproc)?;

        let (num_machines, num_mpiprocs_per_machine) = match (machines, per_machine, total) {
            (Some(m), Some(p), Some(t)) => {
                if m.checked_mul(p) != Some(t) {
                    return Err(SchedulerError::InvalidResource(
                        "num_machines * num_mpiprocs_per_machine != tot_num_mpiprocs".to_string(),
                    ));
                }
                (m, p)
            }
            (Some(m), Some(p), None) => {
                if m.checked_mul(p).is_none() {
                    return Err(SchedulerError::InvalidResource(
                        "num_machines * num_mpiprocs_per_machine is too large".to_string(),
                    ));
                }
                (m, p)
            }
            (Some(m), None, Some(t)) => {
                if t % m != 0 {
                    return Err(SchedulerError::InvalidResource(
                        "tot_num_mpiprocs must be a multiple of num_machines".to_string(),
                    ));
                }
                (m, t / m)
            }
            (None, Some(p), Some(t)) => {
                if t % p != 0 {
                    return Err(SchedulerError::InvalidResource(
                        "tot_num_mpiprocs must be a multiple of num_mpiprocs_per_machine".to_string(),
                    ));
                }
                (t / p, p)
            }
            _ => {
                return Err(SchedulerError::InvalidResource(
                    "At least two among num_machines, num_mpiprocs_per_machine and tot_num_mpiprocs must be specified"
                        .to_string(),
                ))
            }
        };

        if let (Some(machine), Some(mpiproc)) = (cores_per_machine, cores_per_mpiproc) {
            if mpiproc.checked_mul(num_mpiprocs_per_machine) != Some(machine) {
                return Err(SchedulerError::InvalidResource(
                    "num_cores_per_machine must equal num_cores_per_mpiproc * num_mpiprocs_per_machine"
                        .to_string(),
                ));
            }
        }

        Ok(Self {
            num_machines,
            num_mpiprocs_per_machine,
            num_cores_per_machine: cores_per_machine,
            num_cores_per_mpiproc: cores_per_mpiproc,
        })
    }

    pub fn tot_num_mpiprocs(&self) -> u64 {
        u64::from(self.num_machines) * u64::from(self.num_mpiprocs_per_machine)
    }
}

impl TryFrom<ResourceRequest> for JobResource {
    type Error = SchedulerError;

    fn try_from(request: ResourceRequest) -> Result<Self, Self::Error> {
        Self::new(&request)
    }
}
