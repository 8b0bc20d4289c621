//! Grace-period completion detection.
//!
//! `pending == 0` can be observed while another worker is still discovering
//! children, so completion is two-phase:
//!
//! ```text
//!   Running ──(pending == 0, total > 0)──► Candidate{since}
//!   Candidate ──(new work or heartbeat > since)──► Running
//!   Candidate ──(elapsed ≥ grace, re-read still idle)──► Completed
//! ```
//!
//! [`CompletionState::step`] is the pure transition function.
//! [`CompletionDetector`] applies it against the store, where every
//! transition is a compare-and-set so concurrent callers agree on one winner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus};
use crate::store::JobStore;

/// Completion state of a parent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Running,
    Candidate { since: DateTime<Utc> },
    Completed,
}

/// Live values the transition function looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub pending: u64,
    pub total: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl Observation {
    pub fn of(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            pending: job.progress.pending,
            total: job.progress.total,
            last_heartbeat: job.last_heartbeat,
            now,
        }
    }

    fn is_idle(&self) -> bool {
        self.pending == 0 && self.total > 0
    }
}

/// Action chosen by [`CompletionState::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStep {
    /// Nothing to do.
    Hold,
    /// Record `completion_candidate_at = now`.
    BeginCandidacy,
    /// Candidacy is younger than the grace period.
    Wait { remaining: Duration },
    /// Grace period elapsed; confirm against fresh values.
    Confirm { since: DateTime<Utc> },
    /// New work appeared; drop candidacy.
    Reset,
}

impl CompletionState {
    /// State of a job as persisted. Terminal jobs other than `completed`
    /// also map to [`CompletionState::Completed`]: nothing moves them.
    pub fn of(job: &Job) -> Self {
        match (job.status, job.completion_candidate_at) {
            (JobStatus::Running, Some(since)) => Self::Candidate { since },
            (JobStatus::Running | JobStatus::Pending, None) => Self::Running,
            (JobStatus::Pending, Some(_)) => Self::Running,
            _ => Self::Completed,
        }
    }

    pub fn step(&self, obs: &Observation, grace: Duration) -> CompletionStep {
        match *self {
            Self::Completed => CompletionStep::Hold,
            Self::Running if obs.is_idle() => CompletionStep::BeginCandidacy,
            Self::Running => CompletionStep::Hold,
            Self::Candidate { since } => {
                if !obs.is_idle() || obs.last_heartbeat > since {
                    return CompletionStep::Reset;
                }
                let elapsed = (obs.now - since).to_std().unwrap_or(Duration::ZERO);
                if elapsed < grace {
                    CompletionStep::Wait {
                        remaining: grace - elapsed,
                    }
                } else {
                    CompletionStep::Confirm { since }
                }
            }
        }
    }
}

/// Result of one completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// Work is outstanding.
    Busy,
    /// This call started the grace window.
    CandidacyStarted,
    /// A candidacy is active and will be confirmable after `remaining`.
    Waiting { remaining: Duration },
    /// Candidacy was dropped because new work appeared.
    Reset,
    /// This call moved the job to `completed`.
    Completed,
    /// The job was already terminal (or another caller completed it).
    Terminal(JobStatus),
}

/// Runs the completion protocol for parent jobs.
#[derive(Clone)]
pub struct CompletionDetector {
    store: Arc<dyn JobStore>,
    grace_period: Duration,
}

impl CompletionDetector {
    pub fn new(store: Arc<dyn JobStore>, grace_period: Duration) -> Self {
        Self {
            store,
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Evaluate and, if warranted, advance the completion state of `job_id`.
    ///
    /// Safe to call from any number of workers at once: only the caller whose
    /// compare-and-set succeeds sees [`CompletionCheck::Completed`].
    pub async fn check(&self, job_id: Uuid) -> Result<CompletionCheck, DatabaseError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: job_id.to_string(),
            });
        };
        if job.status.is_terminal() {
            return Ok(CompletionCheck::Terminal(job.status));
        }

        let now = Utc::now();
        match CompletionState::of(&job).step(&Observation::of(&job, now), self.grace_period) {
            CompletionStep::Hold => Ok(CompletionCheck::Busy),
            CompletionStep::BeginCandidacy => {
                if self.store.mark_completion_candidate(job_id, now).await? {
                    debug!(job_id = %job_id, grace_ms = self.grace_period.as_millis() as u64, "Completion candidacy started");
                    Ok(CompletionCheck::CandidacyStarted)
                } else {
                    // Lost the race to another caller or new work arrived.
                    Ok(CompletionCheck::Busy)
                }
            }
            CompletionStep::Wait { remaining } => Ok(CompletionCheck::Waiting { remaining }),
            CompletionStep::Reset => self.reset(job_id).await,
            CompletionStep::Confirm { since } => self.confirm(job_id, since).await,
        }
    }

    async fn confirm(
        &self,
        job_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<CompletionCheck, DatabaseError> {
        // Fresh read: the snapshot above may be stale by now.
        let Some(fresh) = self.store.get_job(job_id).await? else {
            return Ok(CompletionCheck::Busy);
        };
        if fresh.status.is_terminal() {
            return Ok(CompletionCheck::Terminal(fresh.status));
        }
        if fresh.completion_candidate_at != Some(since) {
            // Someone reset or restarted the window in between.
            return Ok(CompletionCheck::Busy);
        }

        let obs = Observation::of(&fresh, Utc::now());
        match CompletionState::of(&fresh).step(&obs, self.grace_period) {
            CompletionStep::Confirm { since } => {
                if self.store.complete_job(job_id, since).await? {
                    info!(
                        job_id = %job_id,
                        total = fresh.progress.total,
                        completed = fresh.progress.completed,
                        failed = fresh.progress.failed,
                        "Job completed"
                    );
                    return Ok(CompletionCheck::Completed);
                }
                match self.store.get_job(job_id).await? {
                    Some(job) if job.status.is_terminal() => Ok(CompletionCheck::Terminal(job.status)),
                    _ => self.reset(job_id).await,
                }
            }
            CompletionStep::Wait { remaining } => Ok(CompletionCheck::Waiting { remaining }),
            _ => self.reset(job_id).await,
        }
    }

    async fn reset(&self, job_id: Uuid) -> Result<CompletionCheck, DatabaseError> {
        if self.store.clear_completion_candidate(job_id).await? {
            debug!(job_id = %job_id, "Completion candidacy reset, new work appeared");
        }
        Ok(CompletionCheck::Reset)
    }
}
