// Bulk operation controller
// Issues one remote call per item, strictly in input order, and tallies outcomes

use crate::config::BulkConfig;
use crate::errors::{Alert, AlertLevel, BulkError, ClientError, ValidationError};
use crate::models::{ItemId, Job, RemoteOutcome};
use crate::selection::{reduce, SelectionAction, SelectionState};
use crate::telemetry;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Fallback message when the remote reports failure without a detail
pub const GENERIC_FAILURE: &str = "The control plane reported a failure";

/// Wording used in logs, metrics and user-facing summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionLabels {
    /// Metric/log name and infinitive, e.g. "terminate"
    pub name: &'static str,
    /// Past participle, e.g. "terminated"
    pub done: &'static str,
    /// Singular item noun, e.g. "job"
    pub noun: &'static str,
}

impl ActionLabels {
    pub const TERMINATE: ActionLabels = ActionLabels {
        name: "terminate",
        done: "terminated",
        noun: "job",
    };

    pub const CLEANUP_STALE: ActionLabels = ActionLabels {
        name: "cleanup",
        done: "cleaned up",
        noun: "stale execution set",
    };

    fn count(&self, n: usize) -> String {
        if n == 1 {
            format!("{} {}", n, self.noun)
        } else {
            format!("{} {}s", n, self.noun)
        }
    }
}

/// A lifecycle action that can be applied to one item on the control plane
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteAction: Send + Sync {
    fn labels(&self) -> ActionLabels;

    /// Issue the call for `item`; an empty `reason` is omitted from the request
    async fn invoke(&self, item: &str, reason: &str) -> Result<RemoteOutcome, ClientError>;
}

/// Something that can re-fetch the source list after a bulk run
pub trait RefreshTrigger: Send + Sync {
    fn trigger_refresh(&self);
}

impl<F> RefreshTrigger for F
where
    F: Fn() + Send + Sync,
{
    fn trigger_refresh(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote answered but reported failure
    Soft,
    /// Non-2xx, network error, timeout or malformed response
    Hard,
    /// The credential was rejected
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub item: ItemId,
    pub error: String,
    pub kind: FailureKind,
}

/// Per-item tally of a bulk run. Transient, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOperationResult {
    pub succeeded: Vec<ItemId>,
    pub failed: Vec<BulkFailure>,
}

impl BulkOperationResult {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Success and failure are reported as two separate alerts
    pub fn alerts(&self, labels: ActionLabels) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if !self.succeeded.is_empty() {
            alerts.push(Alert::new(
                AlertLevel::Success,
                format!(
                    "Successfully {} {}",
                    labels.done,
                    labels.count(self.succeeded.len())
                ),
            ));
        }
        if !self.failed.is_empty() {
            let alert = Alert::new(
                AlertLevel::Error,
                format!(
                    "Failed to {} {}",
                    labels.name,
                    labels.count(self.failed.len())
                ),
            );
            let auth_failed = self
                .failed
                .iter()
                .any(|f| f.kind == FailureKind::Unauthorized);
            alerts.push(if auth_failed { alert.sticky() } else { alert });
        }
        alerts
    }
}

/// Outcome of a selection-driven bulk run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub operation_id: Uuid,
    pub labels: ActionLabels,
    pub result: BulkOperationResult,
    /// Selected jobs that were not running; no call was made for them
    pub skipped: Vec<ItemId>,
    /// Selected items that match no job in the list
    pub unknown: Vec<ItemId>,
}

impl BulkReport {
    pub fn alerts(&self) -> Vec<Alert> {
        self.result.alerts(self.labels)
    }
}

pub struct BulkOperationController {
    item_timeout: Duration,
}

impl BulkOperationController {
    pub fn new(item_timeout: Duration) -> Self {
        Self { item_timeout }
    }

    pub fn from_config(config: &BulkConfig) -> Self {
        Self::new(Duration::from_secs(config.item_timeout_seconds))
    }

    fn validate(items: &[ItemId]) -> Result<(), ValidationError> {
        if items.is_empty() {
            return Err(ValidationError::EmptySelection);
        }
        if items.iter().any(|item| item.trim().is_empty()) {
            return Err(ValidationError::MissingField("item id".to_string()));
        }
        Ok(())
    }

    /// Apply `action` to each item in order.
    ///
    /// Every item is attempted; a failure never stops the loop. The batch is
    /// rejected before any call if an item id is missing.
    #[instrument(skip(self, items, action, reason), fields(action = action.labels().name, items = items.len(), operation_id = %operation_id))]
    async fn run<A>(
        &self,
        operation_id: Uuid,
        items: &[ItemId],
        action: &A,
        reason: &str,
    ) -> Result<BulkOperationResult, BulkError>
    where
        A: RemoteAction + ?Sized,
    {
        Self::validate(items)?;
        let labels = action.labels();
        let mut result = BulkOperationResult::default();

        for item in items {
            let failure = match tokio::time::timeout(self.item_timeout, action.invoke(item, reason))
                .await
            {
                Ok(Ok(outcome)) if outcome.success => None,
                Ok(Ok(outcome)) => Some((
                    outcome
                        .detail
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
                    FailureKind::Soft,
                )),
                Ok(Err(e)) if e.is_unauthorized() => Some((e.to_string(), FailureKind::Unauthorized)),
                Ok(Err(e)) => Some((e.to_string(), FailureKind::Hard)),
                Err(_) => Some((
                    ClientError::Timeout(self.item_timeout).to_string(),
                    FailureKind::Hard,
                )),
            };

            match failure {
                None => {
                    info!(item = %item, "Remote action succeeded");
                    telemetry::record_bulk_item(labels.name, "success");
                    result.succeeded.push(item.clone());
                }
                Some((error, kind)) => {
                    warn!(item = %item, error = %error, kind = ?kind, "Remote action failed");
                    telemetry::record_bulk_item(labels.name, "failure");
                    result.failed.push(BulkFailure {
                        item: item.clone(),
                        error,
                        kind,
                    });
                }
            }
        }

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "Bulk operation finished"
        );
        Ok(result)
    }

    pub async fn execute_bulk<A>(
        &self,
        items: &[ItemId],
        action: &A,
        reason: &str,
    ) -> Result<BulkOperationResult, BulkError>
    where
        A: RemoteAction + ?Sized,
    {
        self.run(Uuid::new_v4(), items, action, reason).await
    }

    /// Single-target analog of [`execute_bulk`](Self::execute_bulk), used for
    /// aggregate actions such as stale cleanup
    pub async fn run_single<A>(
        &self,
        item: &str,
        action: &A,
        reason: &str,
    ) -> Result<BulkOperationResult, BulkError>
    where
        A: RemoteAction + ?Sized,
    {
        self.execute_bulk(&[item.to_string()], action, reason).await
    }

    /// Terminate the selected jobs that are currently running.
    ///
    /// A selected item matches a job by serial or by numeric id; calls are
    /// issued in the order of `jobs` using each job's identifier.
    /// Ineligible selections are skipped without a remote call. Once the run
    /// has started, the returned selection is cleared and `refresher` fires
    /// exactly once, whatever the outcome mix.
    pub async fn terminate_selection<A, R>(
        &self,
        jobs: &[Job],
        selection: &SelectionState,
        action: &A,
        reason: &str,
        refresher: &R,
    ) -> Result<(SelectionState, BulkReport), BulkError>
    where
        A: RemoteAction + ?Sized,
        R: RefreshTrigger + ?Sized,
    {
        let selected = selection.selected();
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for job in jobs
            .iter()
            .filter(|job| selected.iter().any(|item| job.matches_item(item)))
        {
            if job.is_terminable() {
                eligible.push(job.identifier());
            } else {
                skipped.push(job.identifier());
            }
        }
        let unknown: Vec<ItemId> = selected
            .into_iter()
            .filter(|item| !jobs.iter().any(|job| job.matches_item(item)))
            .collect();

        if !skipped.is_empty() {
            warn!(skipped = ?skipped, "Skipping jobs that are not running");
        }
        if !unknown.is_empty() {
            warn!(unknown = ?unknown, "Skipping selections that match no listed job");
        }
        if eligible.is_empty() {
            let rejection = match (skipped.first(), unknown.first()) {
                (Some(item), _) => ValidationError::NotEligible {
                    item: item.clone(),
                    reason: "job is not running".to_string(),
                },
                (None, Some(item)) => ValidationError::NotEligible {
                    item: item.clone(),
                    reason: "job not found".to_string(),
                },
                (None, None) => ValidationError::EmptySelection,
            };
            return Err(rejection.into());
        }

        let operation_id = Uuid::new_v4();
        let result = self.run(operation_id, &eligible, action, reason).await?;

        let cleared = reduce(selection, SelectionAction::Clear);
        refresher.trigger_refresh();

        Ok((
            cleared,
            BulkReport {
                operation_id,
                labels: action.labels(),
                result,
                skipped,
                unknown,
            },
        ))
    }
}
