//! Retry/escalation controller for `condition` steps that wait on an
//! unmet predicate. The policy is closed form: a fixed interval, a fixed
//! attempt budget, then a single escalation action. Attempts are logged
//! append-only per (enrollment, step) so a crash-and-resume never double
//! counts or double-sends a nudge.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::{delay_seconds, DelayUnit};

/// What to do once the retry budget for a condition step is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Advance down the false branch.
    Continue,
    /// Terminate the journey.
    Exit,
    /// Unsubscribe the subscriber, then terminate the journey.
    Unsubscribe,
}

/// Retry configuration carried by a `condition` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub interval_value: u32,
    pub interval_unit: DelayUnit,
    /// Optional nudge re-sent with each retry attempt.
    #[serde(default)]
    pub retry_message_id: Option<Uuid>,
    pub exhausted_action: ExhaustedAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            interval_value: 1,
            interval_unit: DelayUnit::Days,
            retry_message_id: None,
            exhausted_action: ExhaustedAction::Continue,
        }
    }
}

impl RetryPolicy {
    pub fn interval_seconds(&self) -> i64 {
        delay_seconds(self.interval_value, self.interval_unit)
    }
}

/// One logged retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub sent_at: DateTime<Utc>,
    pub condition_met_at: Option<DateTime<Utc>>,
}

/// Append-only log of retry attempts keyed by (enrollment, step).
#[derive(Default)]
pub struct RetryLog {
    attempts: DashMap<(Uuid, Uuid), Vec<RetryAttempt>>,
}

impl RetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self, enrollment_id: Uuid, step_id: Uuid) -> u32 {
        self.attempts
            .get(&(enrollment_id, step_id))
            .map(|a| a.len() as u32)
            .unwrap_or(0)
    }

    pub fn attempts(&self, enrollment_id: Uuid, step_id: Uuid) -> Vec<RetryAttempt> {
        self.attempts
            .get(&(enrollment_id, step_id))
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Append a new attempt and return its number (1-based).
    pub fn record_attempt(&self, enrollment_id: Uuid, step_id: Uuid, now: DateTime<Utc>) -> u32 {
        let mut entry = self.attempts.entry((enrollment_id, step_id)).or_default();
        let attempt_number = entry.len() as u32 + 1;
        entry.push(RetryAttempt {
            attempt_number,
            sent_at: now,
            condition_met_at: None,
        });
        attempt_number
    }

    /// Stamp pending attempts once the condition finally becomes true.
    pub fn mark_condition_met(&self, enrollment_id: Uuid, step_id: Uuid, now: DateTime<Utc>) {
        if let Some(mut entry) = self.attempts.get_mut(&(enrollment_id, step_id)) {
            for attempt in entry.iter_mut().filter(|a| a.condition_met_at.is_none()) {
                attempt.condition_met_at = Some(now);
            }
        }
    }
}

/// Verdict for one unmet-condition wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retries are disabled for this step: keep waiting and re-check later.
    Wait,
    /// Budget remains: a new attempt was logged; re-check after the interval.
    Retry { attempt_number: u32 },
    /// Budget spent: escalate.
    Exhausted(ExhaustedAction),
}

/// Decides retry vs. escalate for an enrollment stuck on a condition step,
/// logging each attempt as it is granted.
#[derive(Default)]
pub struct RetryController {
    log: RetryLog,
}

impl RetryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &RetryLog {
        &self.log
    }

    pub fn decide(
        &self,
        policy: &RetryPolicy,
        enrollment_id: Uuid,
        step_id: Uuid,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !policy.enabled {
            return RetryDecision::Wait;
        }
        let attempts = self.log.attempt_count(enrollment_id, step_id);
        if attempts < policy.max_attempts {
            let attempt_number = self.log.record_attempt(enrollment_id, step_id, now);
            RetryDecision::Retry { attempt_number }
        } else {
            RetryDecision::Exhausted(policy.exhausted_action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts,
            interval_value: 24,
            interval_unit: DelayUnit::Hours,
            retry_message_id: None,
            exhausted_action: ExhaustedAction::Exit,
        }
    }

    #[test]
    fn test_attempts_then_exhaustion() {
        let controller = RetryController::new();
        let policy = policy(3);
        let enrollment_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let mut now = Utc::now();

        for expected in 1..=3 {
            let decision = controller.decide(&policy, enrollment_id, step_id, now);
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    attempt_number: expected
                }
            );
            now += Duration::hours(24);
        }

        let decision = controller.decide(&policy, enrollment_id, step_id, now);
        assert_eq!(decision, RetryDecision::Exhausted(ExhaustedAction::Exit));
        assert_eq!(controller.log().attempt_count(enrollment_id, step_id), 3);

        let attempts = controller.log().attempts(enrollment_id, step_id);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1].sent_at - pair[0].sent_at, Duration::hours(24));
        }
    }

    #[test]
    fn test_disabled_policy_waits_without_logging() {
        let controller = RetryController::new();
        let policy = RetryPolicy::default();
        let enrollment_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        let decision = controller.decide(&policy, enrollment_id, step_id, Utc::now());
        assert_eq!(decision, RetryDecision::Wait);
        assert_eq!(controller.log().attempt_count(enrollment_id, step_id), 0);
    }

    #[test]
    fn test_mark_condition_met_stamps_pending_attempts() {
        let log = RetryLog::new();
        let enrollment_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let now = Utc::now();

        log.record_attempt(enrollment_id, step_id, now);
        log.record_attempt(enrollment_id, step_id, now + Duration::hours(24));
        log.mark_condition_met(enrollment_id, step_id, now + Duration::hours(30));

        let attempts = log.attempts(enrollment_id, step_id);
        assert!(attempts.iter().all(|a| a.condition_met_at.is_some()));
    }

    #[test]
    fn test_logs_are_scoped_per_step() {
        let controller = RetryController::new();
        let policy = policy(1);
        let enrollment_id = Uuid::new_v4();
        let step_a = Uuid::new_v4();
        let step_b = Uuid::new_v4();
        let now = Utc::now();

        controller.decide(&policy, enrollment_id, step_a, now);
        assert_eq!(
            controller.decide(&policy, enrollment_id, step_b, now),
            RetryDecision::Retry { attempt_number: 1 }
        );
    }
}
