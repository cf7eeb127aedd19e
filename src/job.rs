use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::Serialize;

use crate::ingestion::ValidationError;
use crate::output::OutputRef;
use crate::providers::ProviderFailure;
use crate::resolver::ResolveError;

pub type JobId = String;

const JOB_ID_LEN: usize = 12;

pub fn new_job_id() -> JobId {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartiallyCompleted
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    /// Status after every record was processed without a systemic failure.
    pub fn from_counts(processed_count: usize, succeeded_count: usize) -> Self {
        if succeeded_count == processed_count {
            JobStatus::Completed
        } else if succeeded_count == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartiallyCompleted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    Validation,
    NotFound,
    RateLimited,
    ProviderError,
    InvalidGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub record_id: String,
    pub kind: RecordErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn validation(record_id: &str, err: &ValidationError) -> Self {
        Self {
            record_id: record_id.to_string(),
            kind: RecordErrorKind::Validation,
            message: err.to_string(),
        }
    }

    /// Classifies an exhausted resolution by the most telling provider
    /// failure: any NotFound means the address itself is the problem.
    pub fn resolution(record_id: &str, err: &ResolveError) -> Self {
        let kind = match err {
            ResolveError::Exhausted { failures } => {
                let any = |check: fn(&ProviderFailure) -> bool| {
                    failures.iter().any(|(_, failure)| check(failure))
                };
                if any(|failure| matches!(failure, ProviderFailure::NotFound)) {
                    RecordErrorKind::NotFound
                } else if any(|failure| matches!(failure, ProviderFailure::RateLimited { .. })) {
                    RecordErrorKind::RateLimited
                } else {
                    RecordErrorKind::ProviderError
                }
            }
            ResolveError::NoProviders | ResolveError::Cache(_) => RecordErrorKind::ProviderError,
        };
        Self {
            record_id: record_id.to_string(),
            kind,
            message: err.to_string(),
        }
    }

    pub fn geometry(record_id: &str, message: impl Into<String>) -> Self {
        Self {
            record_id: record_id.to_string(),
            kind: RecordErrorKind::InvalidGeometry,
            message: message.into(),
        }
    }
}

/// Mutable job state, owned by the coordinator behind one mutex per job.
#[derive(Debug, Clone)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    pub total_count: usize,
    pub processed_count: usize,
    pub succeeded_count: usize,
    pub errors: Vec<RecordError>,
    pub failure: Option<String>,
    pub output: Option<OutputRef>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(job_id: JobId, total_count: usize) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            total_count,
            processed_count: 0,
            succeeded_count: 0,
            errors: Vec::new(),
            failure: None,
            output: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.processed_count += 1;
        self.succeeded_count += 1;
    }

    pub fn record_failure(&mut self, error: RecordError) {
        self.processed_count += 1;
        self.errors.push(error);
    }

    /// Share of processed records, capped below 100 until the job is
    /// terminal. A terminal empty job reports 100.
    pub fn progress(&self) -> f64 {
        if self.total_count == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        let ratio = self.processed_count as f64 / self.total_count as f64 * 100.0;
        if self.status.is_terminal() {
            ratio
        } else {
            ratio.min(99.0)
        }
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            status: self.status,
            progress: self.progress(),
            total_count: self.total_count,
            processed_count: self.processed_count,
            succeeded_count: self.succeeded_count,
            errors: self.errors.clone(),
            failure: self.failure.clone(),
            output: self.output.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub total_count: usize,
    pub processed_count: usize,
    pub succeeded_count: usize,
    pub errors: Vec<RecordError>,
    pub failure: Option<String>,
    pub output: Option<OutputRef>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    #[test]
    fn job_ids_are_short_lowercase_tokens() {
        let id = new_job_id();
        assert_eq!(id.len(), JOB_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(id, new_job_id());
    }

    #[test]
    fn terminal_status_follows_counts() {
        assert_eq!(JobStatus::from_counts(5, 5), JobStatus::Completed);
        assert_eq!(JobStatus::from_counts(5, 4), JobStatus::PartiallyCompleted);
        assert_eq!(JobStatus::from_counts(5, 0), JobStatus::Failed);
        assert_eq!(JobStatus::from_counts(0, 0), JobStatus::Completed);
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn progress_reaches_100_only_when_terminal() {
        let mut state = JobState::new("job".into(), 2);
        assert_eq!(state.progress(), 0.0);
        state.status = JobStatus::Running;
        state.record_success();
        assert_eq!(state.progress(), 50.0);
        state.record_failure(RecordError::geometry("r2", "bad"));
        assert_eq!(state.progress(), 99.0);
        state.finish(JobStatus::PartiallyCompleted);
        assert_eq!(state.progress(), 100.0);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.processed_count, 2);
        assert_eq!(snapshot.succeeded_count, 1);
        assert_eq!(snapshot.errors.len(), 1);
        assert!(snapshot.finished_at.is_some());
    }

    #[test]
    fn cancelled_job_reports_processed_share() {
        let mut state = JobState::new("job".into(), 10);
        state.status = JobStatus::Running;
        for _ in 0..3 {
            state.record_success();
        }
        state.finish(JobStatus::Cancelled);
        assert_eq!(state.progress(), 30.0);
        assert_eq!(state.snapshot().progress, 30.0);
    }

    #[test]
    fn classifies_resolution_failures() {
        let exhausted = |failures| ResolveError::Exhausted { failures };
        let not_found = exhausted(vec![
            (
                ProviderKind::PrimaryCommercial,
                ProviderFailure::RateLimited { retry_after: None },
            ),
            (ProviderKind::OpenFallback, ProviderFailure::NotFound),
        ]);
        assert_eq!(
            RecordError::resolution("r", &not_found).kind,
            RecordErrorKind::NotFound
        );

        let limited = exhausted(vec![
            (
                ProviderKind::PrimaryCommercial,
                ProviderFailure::RateLimited { retry_after: None },
            ),
            (
                ProviderKind::OpenFallback,
                ProviderFailure::Transport("down".into()),
            ),
        ]);
        assert_eq!(
            RecordError::resolution("r", &limited).kind,
            RecordErrorKind::RateLimited
        );

        let transport = exhausted(vec![(
            ProviderKind::OpenFallback,
            ProviderFailure::Transport("down".into()),
        )]);
        let error = RecordError::resolution("r", &transport);
        assert_eq!(error.kind, RecordErrorKind::ProviderError);
        assert!(error.message.contains("open"));
    }

    #[test]
    fn snapshot_serializes_snake_case_status() {
        let mut state = JobState::new("job".into(), 0);
        state.finish(JobStatus::PartiallyCompleted);
        let value = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(value["status"], "partially_completed");
        assert_eq!(value["progress"], 100.0);
    }
}
