//! Retry and dead-letter policy.
//!
//! A failed attempt either re-enqueues the item as a fresh entry with
//! `attempt + 1`, or, once `attempt >= max_retry`, moves it to the
//! dead-letter stream together with the failure reason. This is separate
//! from visibility-timeout reclaims, which replay an attempt without
//! incrementing it.

use crate::pipeline::PipelineError;
use crate::work_item::{ItemError, WorkItem};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub const FIELD_LAST_ERROR: &str = "lastError";
pub const FIELD_LAST_ERROR_KIND: &str = "lastErrorKind";
pub const FIELD_FAILURE_REASON: &str = "failureReason";
pub const FIELD_FAILURE_KIND: &str = "failureKind";
pub const FIELD_ORIGINAL_ENTRY_ID: &str = "originalEntryId";
pub const FIELD_DEAD_LETTERED_AT: &str = "deadLetteredAt";

/// Why a processing attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("upload error: {failed}/{total} artifacts failed: {detail}")]
    Upload {
        failed: usize,
        total: usize,
        detail: String,
    },
}

impl AttemptError {
    /// Stable label used in stream fields and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Fetch(_) => "fetch",
            AttemptError::Analysis(_) => "analysis",
            AttemptError::Timeout(_) => "timeout",
            AttemptError::Upload { .. } => "upload",
        }
    }
}

impl From<PipelineError> for AttemptError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Fetch(msg) => AttemptError::Fetch(msg),
            PipelineError::Analysis(msg) => AttemptError::Analysis(msg),
            PipelineError::Timeout(deadline) => AttemptError::Timeout(deadline),
        }
    }
}

/// What to do with a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue at `next_attempt` after `delay`
    Retry { next_attempt: u32, delay: Duration },
    /// Retry budget exhausted
    DeadLetter,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry: u32, delay: Duration) -> Self {
        Self { max_retry, delay }
    }

    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retry {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.delay,
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Items beyond the budget are never handed to the pipeline
    pub fn admits(&self, attempt: u32) -> bool {
        attempt <= self.max_retry
    }

    /// Fields of the re-enqueued entry
    pub fn retry_fields(&self, item: &WorkItem, error: &AttemptError) -> Vec<(String, String)> {
        let mut next = item.next_attempt();
        next.extra.insert(FIELD_LAST_ERROR.to_string(), error.to_string());
        next.extra
            .insert(FIELD_LAST_ERROR_KIND.to_string(), error.kind().to_string());
        next.to_fields()
    }
}

/// Why an entry is being dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterCause {
    /// Retry budget exhausted on this failure
    Exhausted(AttemptError),
    /// Entry arrived with an attempt count beyond the budget
    OverBudget { attempt: u32, max_retry: u32 },
    /// Entry could not be decoded
    Malformed(ItemError),
}

impl DeadLetterCause {
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterCause::Exhausted(err) => err.kind(),
            DeadLetterCause::OverBudget { .. } => "over_budget",
            DeadLetterCause::Malformed(_) => "malformed",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            DeadLetterCause::Exhausted(err) => err.to_string(),
            DeadLetterCause::OverBudget { attempt, max_retry } => {
                format!("attempt {attempt} exceeds max retry {max_retry}")
            }
            DeadLetterCause::Malformed(err) => format!("malformed entry: {err}"),
        }
    }
}

/// Dead-letter record: the original fields unchanged plus the failure
pub fn dead_letter_fields(
    original: &BTreeMap<String, String>,
    entry_id: &str,
    cause: &DeadLetterCause,
) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = original
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.push((FIELD_FAILURE_REASON.to_string(), cause.reason()));
    fields.push((FIELD_FAILURE_KIND.to_string(), cause.kind().to_string()));
    fields.push((FIELD_ORIGINAL_ENTRY_ID.to_string(), entry_id.to_string()));
    fields.push((
        FIELD_DEAD_LETTERED_AT.to_string(),
        Utc::now().timestamp_millis().to_string(),
    ));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    #[test]
    fn test_retry_below_budget() {
        assert_eq!(
            policy().decide(0),
            RetryDecision::Retry {
                next_attempt: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            policy().decide(2),
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_dead_letter_at_budget() {
        assert_eq!(policy().decide(3), RetryDecision::DeadLetter);
        assert_eq!(policy().decide(7), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_zero_budget_dead_letters_first_failure() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).decide(0), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_admits_never_exceeds_budget() {
        assert!(policy().admits(3));
        assert!(!policy().admits(4));
    }

    #[test]
    fn test_retry_fields_carry_last_error() {
        let item = WorkItem::new("cam1", "http://x/cam1.m3u8", 10);
        let fields: BTreeMap<_, _> = policy()
            .retry_fields(&item, &AttemptError::Fetch("404".to_string()))
            .into_iter()
            .collect();
        assert_eq!(fields["attempt"], "1");
        assert_eq!(fields["sourceId"], "cam1");
        assert_eq!(fields[FIELD_LAST_ERROR_KIND], "fetch");
        assert_eq!(fields[FIELD_LAST_ERROR], "fetch error: 404");
    }

    #[test]
    fn test_dead_letter_fields_keep_original() {
        let original: BTreeMap<String, String> = [
            ("sourceId", "cam1"),
            ("mediaRef", "http://x/cam1.m3u8"),
            ("durationSeconds", "10"),
            ("attempt", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let cause = DeadLetterCause::Exhausted(AttemptError::Timeout(Duration::from_secs(240)));
        let fields: BTreeMap<_, _> = dead_letter_fields(&original, "17-0", &cause).into_iter().collect();
        assert_eq!(fields["attempt"], "3");
        assert_eq!(fields[FIELD_FAILURE_KIND], "timeout");
        assert_eq!(fields[FIELD_ORIGINAL_ENTRY_ID], "17-0");
        assert!(fields[FIELD_FAILURE_REASON].contains("timed out"));
    }

    #[test]
    fn test_pipeline_errors_map_to_attempt_errors() {
        assert_eq!(
            AttemptError::from(PipelineError::Fetch("x".to_string())).kind(),
            "fetch"
        );
        assert_eq!(
            AttemptError::from(PipelineError::Timeout(Duration::from_secs(1))).kind(),
            "timeout"
        );
    }
}
