// Filter/sort engine for job and execution list views
// Filters AND together per field; a predicate erroring on malformed data passes the record

use crate::errors::FilterError;
use crate::models::{parse_timestamp, Execution, Job};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A record that exposes its fields as display strings
pub trait Record {
    type Field: Copy + Ord + fmt::Debug;

    /// Stringified value of `field`, or None when the record has no value
    fn field_value(&self, field: Self::Field) -> Option<String>;
}

pub type PredicateFn<T> = Arc<dyn Fn(&T) -> Result<bool, FilterError> + Send + Sync>;

/// A per-field predicate
pub enum Predicate<T> {
    /// Case-insensitive substring match
    Contains(String),
    /// Case-insensitive equality
    Equals(String),
    /// Case-insensitive membership
    OneOf(Vec<String>),
    /// Timestamp range, bounds inclusive
    Between {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
    Custom(PredicateFn<T>),
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        match self {
            Predicate::Contains(s) => Predicate::Contains(s.clone()),
            Predicate::Equals(s) => Predicate::Equals(s.clone()),
            Predicate::OneOf(v) => Predicate::OneOf(v.clone()),
            Predicate::Between { from, to } => Predicate::Between {
                from: *from,
                to: *to,
            },
            Predicate::Custom(f) => Predicate::Custom(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Contains(s) => f.debug_tuple("Contains").field(s).finish(),
            Predicate::Equals(s) => f.debug_tuple("Equals").field(s).finish(),
            Predicate::OneOf(v) => f.debug_tuple("OneOf").field(v).finish(),
            Predicate::Between { from, to } => f
                .debug_struct("Between")
                .field("from", from)
                .field("to", to)
                .finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl<T: Record> Predicate<T> {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&T) -> Result<bool, FilterError> + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    /// Empty text predicates do not filter anything
    pub fn is_active(&self) -> bool {
        match self {
            Predicate::Contains(s) | Predicate::Equals(s) => !s.trim().is_empty(),
            Predicate::OneOf(values) => values.iter().any(|v| !v.trim().is_empty()),
            Predicate::Between { from, to } => from.is_some() || to.is_some(),
            Predicate::Custom(_) => true,
        }
    }

    fn evaluate(&self, record: &T, field: T::Field) -> Result<bool, FilterError> {
        let folded = || record.field_value(field).map(|value| value.to_lowercase());

        match self {
            Predicate::Custom(f) => f(record),
            Predicate::Contains(needle) => {
                Ok(folded().is_some_and(|value| value.contains(&needle.trim().to_lowercase())))
            }
            Predicate::Equals(expected) => {
                Ok(folded().is_some_and(|value| value == expected.trim().to_lowercase()))
            }
            Predicate::OneOf(options) => Ok(folded().is_some_and(|value| {
                options
                    .iter()
                    .any(|option| value == option.trim().to_lowercase())
            })),
            Predicate::Between { from, to } => {
                let Some(value) = record.field_value(field) else {
                    return Ok(false);
                };
                let at = parse_timestamp(&value).ok_or_else(|| FilterError::Malformed {
                    field: format!("{:?}", field),
                    reason: format!("'{}' is not a timestamp", value),
                })?;
                Ok(from.map_or(true, |from| at >= from) && to.map_or(true, |to| at <= to))
            }
        }
    }
}

/// Active filters keyed by field; a record must pass every one of them
pub struct FilterSet<T: Record> {
    filters: BTreeMap<T::Field, Predicate<T>>,
}

impl<T: Record> Default for FilterSet<T> {
    fn default() -> Self {
        Self {
            filters: BTreeMap::new(),
        }
    }
}

impl<T: Record> Clone for FilterSet<T> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<T: Record> fmt::Debug for FilterSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.filters.iter()).finish()
    }
}

impl<T: Record> FilterSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FilterSet::insert`]
    pub fn with(mut self, field: T::Field, predicate: Predicate<T>) -> Self {
        self.insert(field, predicate);
        self
    }

    /// Register a predicate for `field`, replacing any previous one
    pub fn insert(&mut self, field: T::Field, predicate: Predicate<T>) {
        self.filters.insert(field, predicate);
    }

    pub fn remove(&mut self, field: T::Field) {
        self.filters.remove(&field);
    }

    pub fn active_count(&self) -> usize {
        self.filters.values().filter(|p| p.is_active()).count()
    }

    /// True if the record passes every active filter
    pub fn matches(&self, record: &T) -> bool {
        self.filters
            .iter()
            .filter(|(_, predicate)| predicate.is_active())
            .all(|(field, predicate)| match predicate.evaluate(record, *field) {
                Ok(passed) => passed,
                Err(e) => {
                    tracing::debug!(error = %e, "Filter predicate failed, record kept");
                    true
                }
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec<F> {
    pub field: F,
    pub direction: SortDirection,
}

impl<F> SortSpec<F> {
    pub fn ascending(field: F) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: F) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

/// Filter then stably sort `items`.
///
/// Sorting compares the lowercased stringified field value; missing values
/// sort as the empty string.
pub fn apply<T>(items: &[T], filters: &FilterSet<T>, sort: Option<SortSpec<T::Field>>) -> Vec<T>
where
    T: Record + Clone,
{
    let mut selected: Vec<T> = items
        .iter()
        .filter(|item| filters.matches(item))
        .cloned()
        .collect();

    if let Some(spec) = sort {
        let key = |item: &T| {
            item.field_value(spec.field)
                .unwrap_or_default()
                .to_lowercase()
        };
        match spec.direction {
            SortDirection::Ascending => selected.sort_by_cached_key(key),
            SortDirection::Descending => selected.sort_by_cached_key(|item| Reverse(key(item))),
        }
    }

    selected
}

fn timestamp(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

// ============================================================================
// Record implementations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobField {
    Id,
    Serial,
    Name,
    Status,
    ScheduledAt,
    CreatedAt,
    LastExecutionStatus,
    LastExecutionStartedAt,
}

impl Record for Job {
    type Field = JobField;

    fn field_value(&self, field: JobField) -> Option<String> {
        match field {
            JobField::Id => Some(self.id.to_string()),
            JobField::Serial => self.serial.clone(),
            JobField::Name => Some(self.name.clone()),
            JobField::Status => Some(self.status.to_string()),
            JobField::ScheduledAt => timestamp(&self.scheduled_at),
            JobField::CreatedAt => timestamp(&self.created_at),
            JobField::LastExecutionStatus => {
                self.last_execution.as_ref().map(|e| e.status.to_string())
            }
            JobField::LastExecutionStartedAt => self
                .last_execution
                .as_ref()
                .and_then(|e| timestamp(&e.started_at)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionField {
    JobId,
    ExecutionNumber,
    ExecutionSerial,
    Status,
    StartedAt,
    CompletedAt,
}

impl Record for Execution {
    type Field = ExecutionField;

    fn field_value(&self, field: ExecutionField) -> Option<String> {
        match field {
            ExecutionField::JobId => Some(self.job_id.to_string()),
            ExecutionField::ExecutionNumber => Some(self.execution_number.to_string()),
            ExecutionField::ExecutionSerial => Some(self.execution_serial()),
            ExecutionField::Status => Some(self.status.to_string()),
            ExecutionField::StartedAt => timestamp(&self.started_at),
            ExecutionField::CompletedAt => timestamp(&self.completed_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use chrono::TimeZone;

    fn job(id: i64, name: &str, status: JobStatus) -> Job {
        Job {
            id,
            serial: None,
            name: name.to_string(),
            status,
            scheduled_at: None,
            last_execution: None,
            created_at: None,
        }
    }

    fn ids(jobs: &[Job]) -> Vec<i64> {
        jobs.iter().map(|j| j.id).collect()
    }

    #[test]
    fn test_filters_and_across_fields() {
        let jobs = vec![
            job(1, "Deploy web", JobStatus::Running),
            job(2, "Deploy db", JobStatus::Completed),
            job(3, "Backup", JobStatus::Running),
        ];
        let filters = FilterSet::new()
            .with(JobField::Name, Predicate::Contains("deploy".to_string()))
            .with(JobField::Status, Predicate::Equals("RUNNING".to_string()));

        assert_eq!(ids(&apply(&jobs, &filters, None)), vec![1]);
    }

    #[test]
    fn test_empty_predicates_are_inactive() {
        let jobs = vec![job(1, "a", JobStatus::Draft), job(2, "b", JobStatus::Paused)];
        let filters = FilterSet::new()
            .with(JobField::Name, Predicate::Contains("  ".to_string()))
            .with(JobField::Status, Predicate::OneOf(Vec::new()));

        assert_eq!(filters.active_count(), 0);
        assert_eq!(ids(&apply(&jobs, &filters, None)), vec![1, 2]);
    }

    #[test]
    fn test_custom_predicate_runs_on_fields_without_value() {
        let mut tagged = job(1, "a", JobStatus::Draft);
        tagged.serial = Some("JOB-1".to_string());
        let jobs = vec![tagged, job(2, "b", JobStatus::Draft)];
        let filters = FilterSet::new().with(
            JobField::Serial,
            Predicate::custom(|job: &Job| Ok(job.serial.is_none())),
        );
        assert_eq!(ids(&apply(&jobs, &filters, None)), vec![2]);

        let text = FilterSet::new().with(JobField::Serial, Predicate::Contains("job".to_string()));
        assert_eq!(ids(&apply(&jobs, &text, None)), vec![1]);
    }

    #[test]
    fn test_failing_predicate_keeps_record() {
        let jobs = vec![job(1, "a", JobStatus::Draft), job(2, "b", JobStatus::Draft)];
        let filters = FilterSet::new().with(
            JobField::Name,
            Predicate::custom(|job: &Job| {
                if job.id == 2 {
                    Err(FilterError::Malformed {
                        field: "name".to_string(),
                        reason: "corrupt".to_string(),
                    })
                } else {
                    Ok(false)
                }
            }),
        );

        assert_eq!(ids(&apply(&jobs, &filters, None)), vec![2]);
    }

    #[test]
    fn test_between_on_non_timestamp_fails_open() {
        let jobs = vec![job(1, "not-a-date", JobStatus::Draft)];
        let filters = FilterSet::new().with(
            JobField::Name,
            Predicate::Between {
                from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                to: None,
            },
        );
        assert_eq!(apply(&jobs, &filters, None).len(), 1);
    }

    #[test]
    fn test_between_filters_timestamps() {
        let mut old = job(1, "old", JobStatus::Completed);
        old.created_at = Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
        let mut new = job(2, "new", JobStatus::Completed);
        new.created_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let undated = job(3, "undated", JobStatus::Completed);

        let filters = FilterSet::new().with(
            JobField::CreatedAt,
            Predicate::Between {
                from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                to: None,
            },
        );
        assert_eq!(ids(&apply(&[old, new, undated], &filters, None)), vec![2]);
    }

    #[test]
    fn test_sort_is_case_insensitive_and_stable() {
        let jobs = vec![
            job(1, "beta", JobStatus::Draft),
            job(2, "Alpha", JobStatus::Draft),
            job(3, "BETA", JobStatus::Draft),
            job(4, "alpha", JobStatus::Draft),
        ];
        let none = FilterSet::new();

        let asc = apply(&jobs, &none, Some(SortSpec::ascending(JobField::Name)));
        assert_eq!(ids(&asc), vec![2, 4, 1, 3]);

        let desc = apply(&jobs, &none, Some(SortSpec::descending(JobField::Name)));
        assert_eq!(ids(&desc), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_missing_values_sort_as_empty() {
        let mut scheduled = job(1, "a", JobStatus::Scheduled);
        scheduled.scheduled_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let unscheduled = job(2, "b", JobStatus::Draft);

        let sorted = apply(
            &[scheduled, unscheduled],
            &FilterSet::new(),
            Some(SortSpec::ascending(JobField::ScheduledAt)),
        );
        assert_eq!(ids(&sorted), vec![2, 1]);
    }

    #[test]
    fn test_execution_fields() {
        let execution = Execution {
            job_id: 5,
            execution_number: 3,
            status: crate::models::RunStatus::Failed,
            started_at: None,
            completed_at: None,
            branches: Vec::new(),
            stats: Default::default(),
        };
        assert_eq!(
            execution.field_value(ExecutionField::ExecutionSerial).as_deref(),
            Some("5_3")
        );
        assert_eq!(execution.field_value(ExecutionField::StartedAt), None);
        let filters =
            FilterSet::new().with(ExecutionField::Status, Predicate::Equals("failed".into()));
        assert!(filters.matches(&execution));
    }
}
