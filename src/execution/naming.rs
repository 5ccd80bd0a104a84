//! Deterministic execution names.

use uuid::Uuid;

use crate::core::job::ExecutionKind;
use crate::core::types::{ExecutionId, JobId};

/// Maximum length of an execution name accepted by the workflow engine.
pub const EXECUTION_NAME_LEN: usize = 20;

/// Name of the `kind` execution of a job.
///
/// The name only depends on the job id and the kind, so a retried start
/// finds the execution created by an earlier attempt instead of creating a
/// second one. Names start with a letter (`m` or `r`) followed by hex digits.
pub fn execution_name(job_id: &JobId, kind: ExecutionKind) -> ExecutionId {
    let prefix = match kind {
        ExecutionKind::Main => 'm',
        ExecutionKind::Revert => 'r',
    };
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, job_id.as_str().as_bytes())
        .simple()
        .to_string();
    let mut name = String::with_capacity(EXECUTION_NAME_LEN);
    name.push(prefix);
    name.push_str(&digest[..EXECUTION_NAME_LEN - 1]);
    ExecutionId::new(name)
}
