//! Enrollments — the live state of one subscriber's journey through one
//! funnel — and the store that selects, claims, and persists them.
//!
//! Each enrollment is an isolated state machine keyed by its own row, so
//! passes parallelize across workers. The store enforces the double-claim
//! guard: a worker must win the atomic claim before interpreting, and a
//! claim abandoned by a crashed worker expires after the lease.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use funnel_core::error::{FunnelError, FunnelResult};

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Waiting,
    Completed,
    Paused,
    Exited,
}

/// Journal entry in an enrollment's history blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    pub step_id: Option<Uuid>,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

/// Exclusivity marker held by the worker advancing this enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// One (funnel, subscriber) journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub funnel_id: Uuid,
    pub subscriber_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step_id: Option<Uuid>,
    /// Non-null exactly while `status == Waiting`.
    pub next_action_at: Option<DateTime<Utc>>,
    /// Wake time stashed while paused, restored on resume.
    pub paused_wake_at: Option<DateTime<Utc>>,
    pub steps_completed: u32,
    /// Per-step fired flags so a crash-and-resume never double-sends.
    pub dispatched_steps: HashSet<Uuid>,
    pub history: Vec<HistoryEntry>,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub claim: Option<Claim>,
}

impl Enrollment {
    pub fn new(funnel_id: Uuid, subscriber_id: Uuid, start_step_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            funnel_id,
            subscriber_id,
            status: EnrollmentStatus::Active,
            current_step_id: Some(start_step_id),
            next_action_at: None,
            paused_wake_at: None,
            steps_completed: 0,
            dispatched_steps: HashSet::new(),
            history: Vec::new(),
            entered_at: now,
            updated_at: now,
            completed_at: None,
            exit_reason: None,
            claim: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EnrollmentStatus::Active => true,
            EnrollmentStatus::Waiting => self
                .next_action_at
                .map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn record_history(
        &mut self,
        action: impl Into<String>,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.history.push(HistoryEntry {
            action: action.into(),
            step_id: self.current_step_id,
            at: now,
            detail,
        });
        self.updated_at = now;
    }

    /// Move to a step and mark for immediate processing.
    pub fn move_to_step(&mut self, step_id: Uuid, now: DateTime<Utc>) {
        self.current_step_id = Some(step_id);
        self.status = EnrollmentStatus::Active;
        self.next_action_at = None;
        self.updated_at = now;
    }

    /// Park until the given instant.
    pub fn schedule_wake(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Waiting;
        self.next_action_at = Some(at);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Completed;
        self.current_step_id = None;
        self.next_action_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_exited(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Exited;
        self.next_action_at = None;
        self.exit_reason = Some(reason.into());
        self.updated_at = now;
    }
}

/// Per-funnel counts by enrollment status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub paused: u64,
    pub exited: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.active + self.waiting + self.completed + self.paused + self.exited
    }
}

/// Thread-safe in-memory enrollment store.
///
/// Production: replace with a relational store using row-level locks; the
/// claim API here maps directly onto a conditional UPDATE.
pub struct EnrollmentStore {
    enrollments: DashMap<Uuid, Enrollment>,
    by_pair: DashMap<(Uuid, Uuid), Uuid>,
    claim_lease: Duration,
}

impl EnrollmentStore {
    pub fn new(claim_lease_secs: u64) -> Self {
        Self {
            enrollments: DashMap::new(),
            by_pair: DashMap::new(),
            claim_lease: Duration::seconds(claim_lease_secs as i64),
        }
    }

    /// Insert a fresh enrollment, enforcing (funnel, subscriber) uniqueness.
    pub fn insert(&self, enrollment: Enrollment) -> FunnelResult<Uuid> {
        let pair = (enrollment.funnel_id, enrollment.subscriber_id);
        match self.by_pair.entry(pair) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FunnelError::AlreadyEnrolled {
                funnel_id: enrollment.funnel_id,
                subscriber_id: enrollment.subscriber_id,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let id = enrollment.id;
                slot.insert(id);
                self.enrollments.insert(id, enrollment);
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Enrollment> {
        self.enrollments.get(&id).map(|e| e.clone())
    }

    pub fn get_by_pair(&self, funnel_id: Uuid, subscriber_id: Uuid) -> Option<Enrollment> {
        let id = self.by_pair.get(&(funnel_id, subscriber_id))?;
        self.get(*id)
    }

    /// Persist an enrollment mutation. Called after every single step
    /// transition so an interrupted pass resumes cleanly.
    pub fn save(&self, enrollment: Enrollment) {
        self.enrollments.insert(enrollment.id, enrollment);
    }

    /// Select due enrollments: status permits advancement, wake time (if
    /// any) has elapsed, and no live claim is held. Oldest due first,
    /// capped at `limit`.
    pub fn due_batch(&self, now: DateTime<Utc>, limit: usize) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .enrollments
            .iter()
            .filter(|e| e.is_due(now) && !self.claim_is_live(e.claim.as_ref(), now))
            .map(|e| (e.next_action_at.unwrap_or(e.updated_at), e.id))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    fn claim_is_live(&self, claim: Option<&Claim>, now: DateTime<Utc>) -> bool {
        claim.map_or(false, |c| now - c.claimed_at < self.claim_lease)
    }

    /// Atomically claim an enrollment for a worker. Fails when the row is
    /// no longer due or another worker holds a live claim; an expired
    /// lease (crashed worker) is taken over.
    pub fn try_claim(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> bool {
        let mut enrollment = match self.enrollments.get_mut(&id) {
            Some(e) => e,
            None => return false,
        };
        if !enrollment.is_due(now) {
            return false;
        }
        if self.claim_is_live(enrollment.claim.as_ref(), now) {
            return false;
        }
        enrollment.claim = Some(Claim {
            worker_id: worker_id.to_string(),
            claimed_at: now,
        });
        true
    }

    /// Release a claim. A failure here must be loud: a silently dropped
    /// release would leave the row locked until the lease expires.
    pub fn release(&self, id: Uuid) -> FunnelResult<()> {
        let mut enrollment = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| FunnelError::Storage(format!("enrollment {} missing on release", id)))?;
        enrollment.claim = None;
        Ok(())
    }

    /// Park all advanceable enrollments of a funnel. Completed and exited
    /// rows are untouched. Returns the number paused.
    pub fn pause_funnel(&self, funnel_id: Uuid, now: DateTime<Utc>) -> usize {
        let mut paused = 0;
        for mut enrollment in self.enrollments.iter_mut() {
            if enrollment.funnel_id != funnel_id {
                continue;
            }
            if matches!(
                enrollment.status,
                EnrollmentStatus::Active | EnrollmentStatus::Waiting
            ) {
                enrollment.paused_wake_at = enrollment.next_action_at.take();
                enrollment.status = EnrollmentStatus::Paused;
                enrollment.updated_at = now;
                paused += 1;
            }
        }
        info!(funnel_id = %funnel_id, paused = paused, "paused funnel enrollments");
        paused
    }

    /// Resume a funnel's paused enrollments, restoring stashed wake times.
    /// Retry counters live in the retry log and are preserved as-is.
    pub fn resume_funnel(&self, funnel_id: Uuid, now: DateTime<Utc>) -> usize {
        let mut resumed = 0;
        for mut enrollment in self.enrollments.iter_mut() {
            if enrollment.funnel_id != funnel_id
                || enrollment.status != EnrollmentStatus::Paused
            {
                continue;
            }
            match enrollment.paused_wake_at.take() {
                Some(at) => {
                    enrollment.status = EnrollmentStatus::Waiting;
                    enrollment.next_action_at = Some(at);
                }
                None => {
                    enrollment.status = EnrollmentStatus::Active;
                    enrollment.next_action_at = None;
                }
            }
            enrollment.updated_at = now;
            resumed += 1;
        }
        resumed
    }

    /// Pause a single enrollment.
    pub fn pause_one(&self, id: Uuid, now: DateTime<Utc>) -> FunnelResult<()> {
        let mut enrollment = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| FunnelError::NotFound(format!("enrollment {}", id)))?;
        if matches!(
            enrollment.status,
            EnrollmentStatus::Active | EnrollmentStatus::Waiting
        ) {
            enrollment.paused_wake_at = enrollment.next_action_at.take();
            enrollment.status = EnrollmentStatus::Paused;
            enrollment.updated_at = now;
        }
        Ok(())
    }

    /// Resume a single paused enrollment.
    pub fn resume_one(&self, id: Uuid, now: DateTime<Utc>) -> FunnelResult<()> {
        let mut enrollment = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| FunnelError::NotFound(format!("enrollment {}", id)))?;
        if enrollment.status == EnrollmentStatus::Paused {
            match enrollment.paused_wake_at.take() {
                Some(at) => {
                    enrollment.status = EnrollmentStatus::Waiting;
                    enrollment.next_action_at = Some(at);
                }
                None => {
                    enrollment.status = EnrollmentStatus::Active;
                    enrollment.next_action_at = None;
                }
            }
            enrollment.updated_at = now;
        }
        Ok(())
    }

    pub fn counts_by_status(&self, funnel_id: Uuid) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for enrollment in self.enrollments.iter() {
            if enrollment.funnel_id != funnel_id {
                continue;
            }
            match enrollment.status {
                EnrollmentStatus::Active => counts.active += 1,
                EnrollmentStatus::Waiting => counts.waiting += 1,
                EnrollmentStatus::Completed => counts.completed += 1,
                EnrollmentStatus::Paused => counts.paused += 1,
                EnrollmentStatus::Exited => counts.exited += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}
