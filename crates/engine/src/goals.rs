//! Goal conversion tracking.
//!
//! A goal step converts at most once per enrollment: the first pass through
//! records the conversion, every later pass is a no-op. Conversions also
//! credit the enrollment's split variant when one was assigned upstream.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::GoalKind;

/// A recorded goal conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalConversion {
    pub step_id: Uuid,
    pub enrollment_id: Uuid,
    pub funnel_id: Uuid,
    pub subscriber_id: Uuid,
    pub goal_name: String,
    pub goal_kind: GoalKind,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a recording attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalOutcome {
    Recorded,
    AlreadyRecorded,
}

/// Write-once conversion ledger keyed by (goal step, enrollment).
///
/// Production: replace with an insert guarded by a unique index.
#[derive(Default)]
pub struct GoalRecorder {
    conversions: DashMap<(Uuid, Uuid), GoalConversion>,
}

impl GoalRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conversion unless one already exists for this
    /// (step, enrollment) pair.
    pub fn record(&self, conversion: GoalConversion) -> GoalOutcome {
        let key = (conversion.step_id, conversion.enrollment_id);
        match self.conversions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => GoalOutcome::AlreadyRecorded,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conversion);
                GoalOutcome::Recorded
            }
        }
    }

    pub fn conversion(&self, step_id: Uuid, enrollment_id: Uuid) -> Option<GoalConversion> {
        self.conversions.get(&(step_id, enrollment_id)).map(|c| c.clone())
    }

    /// All conversions recorded for one funnel.
    pub fn for_funnel(&self, funnel_id: Uuid) -> Vec<GoalConversion> {
        self.conversions
            .iter()
            .filter(|c| c.funnel_id == funnel_id)
            .map(|c| c.clone())
            .collect()
    }

    /// Count and total value of conversions for one goal step.
    pub fn step_totals(&self, step_id: Uuid) -> (u64, f64) {
        let mut count = 0;
        let mut value = 0.0;
        for c in self.conversions.iter() {
            if c.step_id == step_id {
                count += 1;
                value += c.value;
            }
        }
        (count, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversion(step_id: Uuid, enrollment_id: Uuid, value: f64) -> GoalConversion {
        GoalConversion {
            step_id,
            enrollment_id,
            funnel_id: Uuid::new_v4(),
            subscriber_id: Uuid::new_v4(),
            goal_name: "purchase".to_string(),
            goal_kind: GoalKind::Purchase,
            value,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_record_wins() {
        let recorder = GoalRecorder::new();
        let step_id = Uuid::new_v4();
        let enrollment_id = Uuid::new_v4();

        assert_eq!(
            recorder.record(conversion(step_id, enrollment_id, 49.0)),
            GoalOutcome::Recorded
        );
        assert_eq!(
            recorder.record(conversion(step_id, enrollment_id, 99.0)),
            GoalOutcome::AlreadyRecorded
        );

        // Original value preserved.
        let stored = recorder.conversion(step_id, enrollment_id).unwrap();
        assert_eq!(stored.value, 49.0);
        let (count, total) = recorder.step_totals(step_id);
        assert_eq!(count, 1);
        assert_eq!(total, 49.0);
    }

    #[test]
    fn test_distinct_enrollments_each_convert() {
        let recorder = GoalRecorder::new();
        let step_id = Uuid::new_v4();

        for _ in 0..3 {
            let outcome = recorder.record(conversion(step_id, Uuid::new_v4(), 10.0));
            assert_eq!(outcome, GoalOutcome::Recorded);
        }
        let (count, total) = recorder.step_totals(step_id);
        assert_eq!(count, 3);
        assert_eq!(total, 30.0);
    }

    #[test]
    fn test_same_enrollment_different_goal_steps() {
        let recorder = GoalRecorder::new();
        let enrollment_id = Uuid::new_v4();

        assert_eq!(
            recorder.record(conversion(Uuid::new_v4(), enrollment_id, 5.0)),
            GoalOutcome::Recorded
        );
        assert_eq!(
            recorder.record(conversion(Uuid::new_v4(), enrollment_id, 5.0)),
            GoalOutcome::Recorded
        );
    }
}
