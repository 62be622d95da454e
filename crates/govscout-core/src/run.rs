//! Process-wide ingestion run record and its transition rules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{BackoffPolicy, ParseEnumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Outage,
    Failed,
    Completed,
}

text_enum!(RunState, "run state", {
    Idle => "idle",
    Running => "running",
    Outage => "outage",
    Failed => "failed",
    Completed => "completed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub fetched: u64,
    pub deduplicated: u64,
    pub passed_filter: u64,
    pub scored_above_threshold: u64,
    pub stored: u64,
    pub skipped_malformed: u64,
}

/// When consecutive transient fetch failures become an outage, and how far
/// apart health probes and retries are scheduled afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutagePolicy {
    pub failure_threshold: u32,
    pub retry_backoff: BackoffPolicy,
}

impl Default for OutagePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry_backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_secs(5 * 60),
                max_delay: Duration::from_secs(6 * 60 * 60),
            },
        }
    }
}

impl OutagePolicy {
    pub fn next_retry_at(&self, at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.retry_backoff.delay_for_attempt(retry_count as usize);
        at + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(6))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunTransitionError {
    #[error("an ingestion run is already in progress")]
    AlreadyRunning,
    #[error("listing source outage is unresolved: {reason}")]
    OutageUnresolved { reason: String },
    #[error("no ingestion run is in progress")]
    NotRunning,
    #[error("no outage is active")]
    NotInOutage,
    #[error("an outage requires a non-empty reason")]
    MissingReason,
}

impl RunTransitionError {
    /// Conflicts with the current run state, as opposed to caller mistakes.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RunTransitionError::AlreadyRunning | RunTransitionError::OutageUnresolved { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum RunTransition {
    Start {
        run_id: Uuid,
        at: DateTime<Utc>,
    },
    FetchSucceeded {
        at: DateTime<Utc>,
    },
    FetchFailed {
        reason: String,
        at: DateTime<Utc>,
        policy: OutagePolicy,
    },
    Complete {
        stats: RunStats,
        at: DateTime<Utc>,
    },
    Fail {
        error: String,
        at: DateTime<Utc>,
        policy: OutagePolicy,
    },
    DeclareOutage {
        reason: String,
        at: DateTime<Utc>,
        policy: OutagePolicy,
    },
    ResolveOutage {
        at: DateTime<Utc>,
        policy: OutagePolicy,
    },
    OutageProbeFailed {
        reason: String,
        at: DateTime<Utc>,
        policy: OutagePolicy,
    },
}

impl RunTransition {
    pub fn label(&self) -> &'static str {
        match self {
            RunTransition::Start { .. } => "start",
            RunTransition::FetchSucceeded { .. } => "fetch_succeeded",
            RunTransition::FetchFailed { .. } => "fetch_failed",
            RunTransition::Complete { .. } => "complete",
            RunTransition::Fail { .. } => "fail",
            RunTransition::DeclareOutage { .. } => "declare_outage",
            RunTransition::ResolveOutage { .. } => "resolve_outage",
            RunTransition::OutageProbeFailed { .. } => "outage_probe_failed",
        }
    }

    /// Whether applying this to `before` belongs in the run history. A page
    /// fetch success only counts when it clears a failure streak.
    pub fn records_event(&self, before: &IngestionRun) -> bool {
        match self {
            RunTransition::FetchSucceeded { .. } => before.consecutive_failures > 0,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub state: RunState,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outage: bool,
    pub outage_reason: Option<String>,
    pub outage_detected_at: Option<DateTime<Utc>>,
    pub outage_resolved_at: Option<DateTime<Utc>>,
    pub stats: RunStats,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionRun {
    pub fn idle(now: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Idle,
            run_id: None,
            started_at: None,
            finished_at: None,
            outage: false,
            outage_reason: None,
            outage_detected_at: None,
            outage_resolved_at: None,
            stats: RunStats::default(),
            last_error: None,
            error_count: 0,
            consecutive_failures: 0,
            retry_count: 0,
            next_retry_at: None,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn in_outage(&self) -> bool {
        self.state == RunState::Outage
    }

    /// A scheduled retry or outage probe is due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Apply a transition in place. A rejected transition leaves the record
    /// untouched.
    pub fn apply(&mut self, transition: RunTransition) -> Result<(), RunTransitionError> {
        match transition {
            RunTransition::Start { run_id, at } => {
                match self.state {
                    RunState::Running => return Err(RunTransitionError::AlreadyRunning),
                    RunState::Outage => {
                        return Err(RunTransitionError::OutageUnresolved {
                            reason: self.outage_reason.clone().unwrap_or_default(),
                        })
                    }
                    RunState::Idle | RunState::Failed | RunState::Completed => {}
                }
                self.state = RunState::Running;
                self.run_id = Some(run_id);
                self.started_at = Some(at);
                self.finished_at = None;
                self.stats = RunStats::default();
                self.last_error = None;
                self.error_count = 0;
                self.consecutive_failures = 0;
                self.next_retry_at = None;
                self.updated_at = at;
            }
            RunTransition::FetchSucceeded { at } => {
                self.require_running()?;
                self.consecutive_failures = 0;
                self.updated_at = at;
            }
            RunTransition::FetchFailed { reason, at, policy } => {
                self.require_running()?;
                self.error_count += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(reason.clone());
                self.updated_at = at;
                if self.consecutive_failures >= policy.failure_threshold.max(1) {
                    let reason = format!(
                        "{} consecutive listing fetch failures; last: {reason}",
                        self.consecutive_failures
                    );
                    self.enter_outage(reason, at, policy);
                }
            }
            RunTransition::Complete { stats, at } => {
                self.require_running()?;
                self.state = RunState::Completed;
                self.stats = stats;
                self.finished_at = Some(at);
                self.consecutive_failures = 0;
                self.retry_count = 0;
                self.next_retry_at = None;
                self.updated_at = at;
            }
            RunTransition::Fail { error, at, policy } => {
                self.require_running()?;
                self.state = RunState::Failed;
                self.last_error = Some(error);
                self.error_count += 1;
                self.finished_at = Some(at);
                self.next_retry_at = Some(policy.next_retry_at(at, self.retry_count));
                self.retry_count += 1;
                self.updated_at = at;
            }
            RunTransition::DeclareOutage { reason, at, policy } => {
                if reason.trim().is_empty() {
                    return Err(RunTransitionError::MissingReason);
                }
                if self.in_outage() {
                    return Err(RunTransitionError::OutageUnresolved {
                        reason: self.outage_reason.clone().unwrap_or_default(),
                    });
                }
                if self.is_running() {
                    self.finished_at = Some(at);
                }
                self.last_error = Some(reason.clone());
                self.updated_at = at;
                self.enter_outage(reason, at, policy);
            }
            RunTransition::ResolveOutage { at, policy } => {
                if !self.in_outage() {
                    return Err(RunTransitionError::NotInOutage);
                }
                self.state = RunState::Idle;
                self.outage = false;
                self.outage_resolved_at = Some(at);
                self.consecutive_failures = 0;
                self.next_retry_at = Some(policy.next_retry_at(at, self.retry_count));
                self.retry_count += 1;
                self.updated_at = at;
            }
            RunTransition::OutageProbeFailed { reason, at, policy } => {
                if !self.in_outage() {
                    return Err(RunTransitionError::NotInOutage);
                }
                self.retry_count += 1;
                self.last_error = Some(reason);
                self.next_retry_at = Some(policy.next_retry_at(at, self.retry_count));
                self.updated_at = at;
            }
        }
        Ok(())
    }

    fn require_running(&self) -> Result<(), RunTransitionError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RunTransitionError::NotRunning)
        }
    }

    fn enter_outage(&mut self, reason: String, at: DateTime<Utc>, policy: OutagePolicy) {
        self.state = RunState::Outage;
        self.outage = true;
        self.outage_reason = Some(reason);
        self.outage_detected_at = Some(at);
        self.outage_resolved_at = None;
        self.finished_at = Some(at);
        self.next_retry_at = Some(policy.next_retry_at(at, self.retry_count));
    }
}
