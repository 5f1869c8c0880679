// Result aggregation: flat action results -> branch -> action tree
// Pure functions; re-running on the same input yields the same structure

use crate::models::{
    ActionResult, ActionResultWire, Branch, BranchStats, Execution, ExecutionStats, RunStatus,
};
use crate::rollup;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Branch key used for records that carry no branch or target identity
pub const UNASSIGNED_BRANCH: &str = "unassigned";

/// Sort key for actions inside a branch.
///
/// Variant order matters: numbered actions sort before labelled ones, and
/// both sort before actions without any `action_order`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OrderKey {
    /// Trailing integer of a dotted order such as `1.2.10`
    Numbered(u64),
    /// An order present but not numeric
    Labelled(String),
    /// No order at all; earliest start first, unstarted last
    Unordered(bool, Option<DateTime<Utc>>),
}

impl OrderKey {
    fn of(action: &ActionResult) -> Self {
        let order = action
            .action_order
            .as_deref()
            .map(str::trim)
            .filter(|order| !order.is_empty());

        match order {
            Some(order) => match trailing_segment(order) {
                Some(n) => OrderKey::Numbered(n),
                None => OrderKey::Labelled(order.to_string()),
            },
            None => OrderKey::Unordered(action.started_at.is_none(), action.started_at),
        }
    }
}

/// Parse the trailing numeric segment of a dotted order (`"1.2.3"` -> 3)
pub fn trailing_segment(order: &str) -> Option<u64> {
    order.rsplit('.').next()?.trim().parse().ok()
}

/// Grouping key: branch serial, then branch id, then target id
fn branch_key(record: &ActionResultWire) -> String {
    [&record.branch_serial, &record.branch_id, &record.target_id]
        .into_iter()
        .flatten()
        .map(|key| key.trim())
        .find(|key| !key.is_empty())
        .unwrap_or(UNASSIGNED_BRANCH)
        .to_string()
}

/// `Some(value)` unless the value is blank
fn non_blank(value: &str) -> Option<String> {
    (!value.trim().is_empty()).then(|| value.to_string())
}

fn action_from_wire(record: &ActionResultWire, key: &str) -> ActionResult {
    ActionResult {
        id: record.id,
        branch_id: record
            .branch_id
            .as_deref()
            .and_then(non_blank)
            .unwrap_or_else(|| key.to_string()),
        action_order: record.action_order.clone(),
        action_name: record.action_name.clone(),
        status: record.status,
        started_at: record.started_at,
        completed_at: record.completed_at,
        exit_code: record.exit_code,
        command_executed: record.command_executed.clone(),
        result_output: record.result_output.clone(),
        result_error: record.result_error.clone(),
        execution_time_ms: record.execution_time_ms,
    }
}

/// Count actions by status
pub fn branch_stats(actions: &[ActionResult]) -> BranchStats {
    let count = |status: RunStatus| actions.iter().filter(|a| a.status == status).count();
    BranchStats {
        total: actions.len(),
        completed: count(RunStatus::Completed),
        failed: count(RunStatus::Failed),
        running: count(RunStatus::Running),
    }
}

/// Sum branch stats into execution-level stats
pub fn execution_stats(branches: &[Branch]) -> ExecutionStats {
    let actions = branches
        .iter()
        .fold(BranchStats::default(), |acc, branch| BranchStats {
            total: acc.total + branch.stats.total,
            completed: acc.completed + branch.stats.completed,
            failed: acc.failed + branch.stats.failed,
            running: acc.running + branch.stats.running,
        });
    ExecutionStats {
        branches: branches.len(),
        actions,
    }
}

/// Group flat action results into branches.
///
/// Branches appear in the order their key is first seen. Actions inside a
/// branch are ordered by the trailing segment of `action_order`, then by
/// `started_at` for actions without one. The sort is stable.
pub fn aggregate(records: &[ActionResultWire]) -> Vec<Branch> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut branches: Vec<Branch> = Vec::new();

    for record in records {
        let key = branch_key(record);
        let slot = match index.get(&key) {
            Some(slot) => *slot,
            None => {
                branches.push(Branch {
                    branch_serial: key.clone(),
                    target_id: None,
                    target_name: None,
                    target_type: None,
                    actions: Vec::new(),
                    stats: BranchStats::default(),
                });
                index.insert(key.clone(), branches.len() - 1);
                branches.len() - 1
            }
        };

        let branch = &mut branches[slot];
        // First non-empty value wins for each target field
        if branch.target_id.is_none() {
            branch.target_id = record.target_id.clone();
        }
        if branch.target_name.is_none() {
            branch.target_name = record.target_name.clone();
        }
        if branch.target_type.is_none() {
            branch.target_type = record.target_type.clone();
        }
        branch.actions.push(action_from_wire(record, &key));
    }

    for branch in &mut branches {
        branch.actions.sort_by_cached_key(OrderKey::of);
        branch.stats = branch_stats(&branch.actions);
    }

    tracing::trace!(
        records = records.len(),
        branches = branches.len(),
        "Aggregated action results"
    );

    branches
}

/// Inverse of [`aggregate`]: emit one wire record per action, branch by branch
pub fn flatten(branches: &[Branch]) -> Vec<ActionResultWire> {
    branches
        .iter()
        .flat_map(|branch| {
            branch.actions.iter().map(move |action| ActionResultWire {
                id: action.id,
                branch_serial: non_blank(&branch.branch_serial),
                branch_id: non_blank(&action.branch_id),
                target_id: branch.target_id.clone(),
                target_name: branch.target_name.clone(),
                target_type: branch.target_type.clone(),
                action_order: action.action_order.clone(),
                action_name: action.action_name.clone(),
                status: action.status,
                started_at: action.started_at,
                completed_at: action.completed_at,
                exit_code: action.exit_code,
                command_executed: action.command_executed.clone(),
                result_output: action.result_output.clone(),
                result_error: action.result_error.clone(),
                execution_time_ms: action.execution_time_ms,
            })
        })
        .collect()
}

/// Build an execution view from a flat result list.
///
/// `recorded` carries the execution's own fields as stored by the control
/// plane; its branches are replaced and its status rolled up.
pub fn build_execution(recorded: &Execution, records: &[ActionResultWire]) -> Execution {
    let branches = aggregate(records);
    let mut execution = Execution {
        job_id: recorded.job_id,
        execution_number: recorded.execution_number,
        status: recorded.status,
        started_at: recorded.started_at,
        completed_at: recorded.completed_at,
        stats: execution_stats(&branches),
        branches,
    };
    execution.status = rollup::execution_status(&execution);
    execution
}

/// Re-derive the branch tree of an execution that arrived with nested branches.
/// Branches without a serial are re-keyed by branch id, then target id.
pub fn normalize_execution(execution: &Execution) -> Execution {
    build_execution(execution, &flatten(&execution.branches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(branch: &str, order: Option<&str>, status: RunStatus) -> ActionResultWire {
        ActionResultWire {
            branch_serial: Some(branch.to_string()),
            target_id: Some(format!("target-{}", branch)),
            target_name: Some(format!("host-{}", branch)),
            action_order: order.map(str::to_string),
            action_name: order.unwrap_or("unordered").to_string(),
            status,
            ..Default::default()
        }
    }

    fn orders(branch: &Branch) -> Vec<Option<&str>> {
        branch
            .actions
            .iter()
            .map(|a| a.action_order.as_deref())
            .collect()
    }

    #[test]
    fn test_dotted_orders_compare_numerically() {
        let records = vec![
            record("a", Some("1.10"), RunStatus::Completed),
            record("a", Some("1.2"), RunStatus::Completed),
            record("a", Some("1.1"), RunStatus::Completed),
        ];
        let branches = aggregate(&records);
        assert_eq!(branches.len(), 1);
        assert_eq!(
            orders(&branches[0]),
            vec![Some("1.1"), Some("1.2"), Some("1.10")]
        );
    }

    #[test]
    fn test_branch_order_follows_first_appearance() {
        let records = vec![
            record("web-2", Some("1"), RunStatus::Completed),
            record("web-1", Some("1"), RunStatus::Completed),
            record("web-2", Some("2"), RunStatus::Completed),
        ];
        let branches = aggregate(&records);
        let serials: Vec<_> = branches.iter().map(|b| b.branch_serial.as_str()).collect();
        assert_eq!(serials, vec!["web-2", "web-1"]);
        assert_eq!(branches[0].actions.len(), 2);
        assert_eq!(branches[0].target_name.as_deref(), Some("host-web-2"));
    }

    #[test]
    fn test_unordered_actions_fall_back_to_started_at() {
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

        let mut second = record("a", None, RunStatus::Completed);
        second.action_name = "second".to_string();
        second.started_at = Some(late);
        let mut first = record("a", None, RunStatus::Completed);
        first.action_name = "first".to_string();
        first.started_at = Some(early);
        let mut pending = record("a", None, RunStatus::Scheduled);
        pending.action_name = "pending".to_string();
        let ordered = record("a", Some("3"), RunStatus::Completed);

        let branches = aggregate(&[pending, second, ordered, first]);
        let names: Vec<_> = branches[0]
            .actions
            .iter()
            .map(|a| a.action_name.as_str())
            .collect();
        assert_eq!(names, vec!["3", "first", "second", "pending"]);
    }

    #[test]
    fn test_stats_count_each_status_once() {
        let records = vec![
            record("a", Some("1"), RunStatus::Completed),
            record("a", Some("2"), RunStatus::Failed),
            record("a", Some("3"), RunStatus::Running),
            record("a", Some("4"), RunStatus::Scheduled),
            record("a", Some("5"), RunStatus::Cancelled),
        ];
        let stats = aggregate(&records)[0].stats;
        assert_eq!(
            stats,
            BranchStats {
                total: 5,
                completed: 1,
                failed: 1,
                running: 1
            }
        );
    }

    #[test]
    fn test_records_without_branch_key_are_kept() {
        let mut by_target = ActionResultWire {
            target_id: Some("42".to_string()),
            ..Default::default()
        };
        by_target.action_name = "probe".to_string();
        let orphan = ActionResultWire::default();

        let branches = aggregate(&[by_target, orphan]);
        let serials: Vec<_> = branches.iter().map(|b| b.branch_serial.as_str()).collect();
        assert_eq!(serials, vec!["42", UNASSIGNED_BRANCH]);
    }

    #[test]
    fn test_aggregate_is_idempotent_through_flatten() {
        let records = vec![
            record("b", Some("2.1"), RunStatus::Failed),
            record("a", None, RunStatus::Running),
            record("b", Some("1.1"), RunStatus::Completed),
            record("a", Some("x"), RunStatus::Completed),
            record("a", Some("0.7"), RunStatus::Completed),
        ];
        let once = aggregate(&records);
        assert_eq!(aggregate(&records), once);
        assert_eq!(aggregate(&flatten(&once)), once);
    }

    #[test]
    fn test_build_execution_rolls_up_status() {
        let recorded = Execution {
            job_id: 9,
            execution_number: 2,
            status: RunStatus::Scheduled,
            started_at: None,
            completed_at: None,
            branches: Vec::new(),
            stats: ExecutionStats::default(),
        };
        let records = vec![
            record("a", Some("1"), RunStatus::Completed),
            record("b", Some("1"), RunStatus::Failed),
        ];
        let execution = build_execution(&recorded, &records);
        assert_eq!(execution.status, RunStatus::Failed);
        assert_eq!(execution.stats.branches, 2);
        assert_eq!(execution.stats.actions.total, 2);
        assert_eq!(execution.stats.actions.failed, 1);
        assert_eq!(normalize_execution(&execution), execution);
    }

    #[test]
    fn test_trailing_segment() {
        assert_eq!(trailing_segment("1.2.3"), Some(3));
        assert_eq!(trailing_segment("10"), Some(10));
        assert_eq!(trailing_segment("1.x"), None);
    }
}
