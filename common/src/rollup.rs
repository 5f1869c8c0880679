// Status rollup: derives an aggregate status from a set of child statuses
// Precedence: running > failed > all completed > caller's stored status

use crate::models::{Execution, Job, JobStatus, RunStatus};

/// A status type that can take part in a rollup
pub trait RollupStatus: Copy + PartialEq {
    fn running() -> Self;
    fn failed() -> Self;
    fn completed() -> Self;
}

impl RollupStatus for RunStatus {
    fn running() -> Self {
        RunStatus::Running
    }

    fn failed() -> Self {
        RunStatus::Failed
    }

    fn completed() -> Self {
        RunStatus::Completed
    }
}

impl RollupStatus for JobStatus {
    fn running() -> Self {
        JobStatus::Running
    }

    fn failed() -> Self {
        JobStatus::Failed
    }

    fn completed() -> Self {
        JobStatus::Completed
    }
}

/// Compute the aggregate status of `children`.
///
/// Falls back to `current` when no rule applies, including the empty case.
pub fn rollup<S, I>(children: I, current: S) -> S
where
    S: RollupStatus,
    I: IntoIterator<Item = S>,
{
    let mut any_child = false;
    let mut any_failed = false;
    let mut all_completed = true;

    for status in children {
        any_child = true;
        if status == S::running() {
            return S::running();
        }
        if status == S::failed() {
            any_failed = true;
        }
        if status != S::completed() {
            all_completed = false;
        }
    }

    if any_failed {
        S::failed()
    } else if any_child && all_completed {
        S::completed()
    } else {
        current
    }
}

/// Roll every action of every branch up into the execution's status
pub fn execution_status(execution: &Execution) -> RunStatus {
    let children = execution
        .branches
        .iter()
        .flat_map(|branch| branch.actions.iter().map(|action| action.status));
    rollup(children, execution.status)
}

/// Job-level overall status derived from its executions.
///
/// Falls back to the latest embedded execution summary when no executions
/// were fetched, then to the job's recorded status.
pub fn job_overall_status(job: &Job, executions: &[Execution]) -> JobStatus {
    if executions.is_empty() {
        let children = job
            .last_execution
            .iter()
            .map(|summary| JobStatus::from(summary.status));
        return rollup(children, job.status);
    }

    let children = executions
        .iter()
        .map(|execution| JobStatus::from(execution_status(execution)));
    rollup(children, job.status)
}
