//! Step interpreter — the state machine that advances one claimed
//! enrollment through its funnel graph.
//!
//! Immediate steps (start, message, action, split, goal) are walked in a
//! single pass; timed steps (delay, wait_until, a waiting condition) park
//! the enrollment with a wake time and yield. State is persisted after
//! every single transition so an interrupted pass resumes cleanly, and
//! message dispatch is deduped with a per-step fired flag so a resume
//! never double-sends.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use funnel_core::collaborators::{
    AudienceService, Channel, DispatchOutcome, EngagementSource, MessageDispatcher, Notifier,
    WebhookDispatcher,
};
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::event_bus::{make_event, EventSink, EventType};
use funnel_core::subscriber::SubscriberProfile;
use funnel_experiments::SplitManager;

use crate::enrollment::{Enrollment, EnrollmentStore};
use crate::evaluator::{self, ConditionPredicate};
use crate::goals::{GoalConversion, GoalOutcome, GoalRecorder};
use crate::graph::{ActionKind, FunnelGraph, FunnelStep, StepKind};
use crate::retry::{ExhaustedAction, RetryController, RetryDecision, RetryPolicy};
use crate::schedule::delay_seconds;

/// What one executed step does to the enrollment.
enum Transition {
    /// Advance to a successor and keep walking in this pass.
    Goto(Uuid),
    /// Stay on the current step, waiting until the given instant.
    ParkHere(DateTime<Utc>),
    /// Terminal: journey finished normally.
    Complete,
    /// Terminal: journey ended early.
    Exit(&'static str),
}

/// Everything the interpreter dispatches through.
pub struct Collaborators {
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub audience: Arc<dyn AudienceService>,
    pub webhooks: Arc<dyn WebhookDispatcher>,
    pub engagement: Arc<dyn EngagementSource>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Interpreter {
    collaborators: Collaborators,
    events: Arc<dyn EventSink>,
    retries: RetryController,
    splits: Arc<SplitManager>,
    goals: GoalRecorder,
    /// Wake interval for waiting conditions with retries disabled.
    recheck_interval: Duration,
}

impl Interpreter {
    pub fn new(
        collaborators: Collaborators,
        events: Arc<dyn EventSink>,
        splits: Arc<SplitManager>,
        recheck_interval_secs: u64,
    ) -> Self {
        Self {
            collaborators,
            events,
            retries: RetryController::new(),
            splits,
            goals: GoalRecorder::new(),
            recheck_interval: Duration::seconds(recheck_interval_secs as i64),
        }
    }

    pub fn retries(&self) -> &RetryController {
        &self.retries
    }

    pub fn goals(&self) -> &GoalRecorder {
        &self.goals
    }

    pub fn splits(&self) -> &SplitManager {
        &self.splits
    }

    /// Walk one claimed enrollment as far as it can go in this pass,
    /// persisting after every transition. The caller holds the claim and
    /// releases it afterwards.
    pub fn run(
        &self,
        graph: &FunnelGraph,
        store: &EnrollmentStore,
        enrollment_id: Uuid,
        now: DateTime<Utc>,
    ) -> FunnelResult<()> {
        let mut enrollment = store
            .get(enrollment_id)
            .ok_or_else(|| FunnelError::NotFound(format!("enrollment {}", enrollment_id)))?;

        // Acyclic graph: the walk is bounded by the step count.
        let mut hops = graph.len() + 1;
        while enrollment.is_due(now) && hops > 0 {
            hops -= 1;
            let step_id = match enrollment.current_step_id {
                Some(id) => id,
                None => {
                    return Err(FunnelError::Storage(format!(
                        "enrollment {} is {:?} with no current step",
                        enrollment.id, enrollment.status
                    )))
                }
            };
            let step = graph.step(step_id)?;
            debug!(
                enrollment_id = %enrollment.id,
                step = %step.name,
                kind = step.kind.label(),
                "executing step"
            );

            match self.execute(graph, &mut enrollment, step, now)? {
                Transition::Goto(next) => {
                    enrollment.steps_completed += 1;
                    self.emit(
                        &enrollment,
                        EventType::StepCompleted,
                        Some(step.id),
                        json!({"kind": step.kind.label()}),
                    );
                    enrollment.move_to_step(next, now);
                }
                Transition::ParkHere(wake_at) => {
                    enrollment.schedule_wake(wake_at, now);
                }
                Transition::Complete => {
                    enrollment.record_history("completed", json!({}), now);
                    enrollment.mark_completed(now);
                    metrics::counter!("funnel_enrollments_completed_total").increment(1);
                    self.emit(&enrollment, EventType::EnrollmentCompleted, Some(step.id), json!({}));
                    info!(
                        funnel_id = %enrollment.funnel_id,
                        enrollment_id = %enrollment.id,
                        "enrollment completed"
                    );
                }
                Transition::Exit(reason) => {
                    enrollment.record_history("exited", json!({"reason": reason}), now);
                    enrollment.mark_exited(reason, now);
                    metrics::counter!("funnel_enrollments_exited_total").increment(1);
                    self.emit(
                        &enrollment,
                        EventType::EnrollmentExited,
                        Some(step.id),
                        json!({"reason": reason}),
                    );
                    info!(
                        funnel_id = %enrollment.funnel_id,
                        enrollment_id = %enrollment.id,
                        reason = reason,
                        "enrollment exited"
                    );
                }
            }
            store.save(enrollment.clone());
        }
        Ok(())
    }

    fn execute(
        &self,
        graph: &FunnelGraph,
        enrollment: &mut Enrollment,
        step: &FunnelStep,
        now: DateTime<Utc>,
    ) -> FunnelResult<Transition> {
        match &step.kind {
            StepKind::Start { next } => Ok(Transition::Goto(*next)),

            StepKind::Email { message_id, next } => {
                self.dispatch_message(enrollment, step.id, Channel::Email, *message_id, now)?;
                Ok(Transition::Goto(*next))
            }
            StepKind::Sms { message_id, next } => {
                self.dispatch_message(enrollment, step.id, Channel::Sms, *message_id, now)?;
                Ok(Transition::Goto(*next))
            }

            StepKind::Delay { value, unit, next } => {
                // First visit parks on this step; the wake-up advances.
                if enrollment.dispatched_steps.contains(&step.id) {
                    Ok(Transition::Goto(*next))
                } else {
                    enrollment.dispatched_steps.insert(step.id);
                    Ok(Transition::ParkHere(
                        now + Duration::seconds(delay_seconds(*value, *unit)),
                    ))
                }
            }

            StepKind::WaitUntil { rule, next } => {
                if enrollment.dispatched_steps.contains(&step.id) {
                    Ok(Transition::Goto(*next))
                } else {
                    enrollment.dispatched_steps.insert(step.id);
                    Ok(Transition::ParkHere(rule.resolve(now)))
                }
            }

            StepKind::Condition {
                predicate,
                wait_for_condition,
                retry,
                next_on_true,
                next_on_false,
            } => self.execute_condition(
                enrollment,
                step.id,
                predicate,
                *wait_for_condition,
                retry,
                *next_on_true,
                *next_on_false,
                now,
            ),

            StepKind::Action { action, next } => {
                self.execute_action(enrollment, step.id, action, now)?;
                Ok(Transition::Goto(*next))
            }

            StepKind::Split { variants } => {
                let assignment = self.splits.assign(
                    enrollment.funnel_id,
                    step.id,
                    &step.name,
                    variants,
                    enrollment.id,
                    enrollment.subscriber_id,
                    now,
                )?;
                self.emit(
                    enrollment,
                    EventType::VariantAssigned,
                    Some(step.id),
                    json!({"variant_id": assignment.variant_id}),
                );
                Ok(Transition::Goto(assignment.next_step_id))
            }

            StepKind::Goal {
                name,
                goal_kind,
                value,
                next,
            } => {
                let outcome = self.goals.record(GoalConversion {
                    step_id: step.id,
                    enrollment_id: enrollment.id,
                    funnel_id: enrollment.funnel_id,
                    subscriber_id: enrollment.subscriber_id,
                    goal_name: name.clone(),
                    goal_kind: *goal_kind,
                    value: *value,
                    recorded_at: now,
                });
                if outcome == GoalOutcome::Recorded {
                    metrics::counter!("funnel_goal_conversions_total").increment(1);
                    self.emit(
                        enrollment,
                        EventType::GoalConverted,
                        Some(step.id),
                        json!({"goal": name, "value": value}),
                    );
                    // Credit the variant this enrollment was assigned
                    // upstream, if any. Idempotent per (split, enrollment).
                    for split_id in graph.split_step_ids() {
                        self.splits
                            .record_conversion(split_id, enrollment.id, *value, now);
                    }
                }
                Ok(Transition::Goto(*next))
            }

            StepKind::End => Ok(Transition::Complete),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_condition(
        &self,
        enrollment: &mut Enrollment,
        step_id: Uuid,
        predicate: &ConditionPredicate,
        wait_for_condition: bool,
        retry: &RetryPolicy,
        next_on_true: Uuid,
        next_on_false: Uuid,
        now: DateTime<Utc>,
    ) -> FunnelResult<Transition> {
        let subscriber = self.subscriber(enrollment)?;
        let met = evaluator::evaluate(
            predicate,
            &subscriber,
            enrollment.funnel_id,
            self.collaborators.engagement.as_ref(),
        );

        if met {
            self.retries.log().mark_condition_met(enrollment.id, step_id, now);
            self.emit(enrollment, EventType::ConditionMet, Some(step_id), json!({}));
            return Ok(Transition::Goto(next_on_true));
        }
        if !wait_for_condition {
            return Ok(Transition::Goto(next_on_false));
        }

        match self.retries.decide(retry, enrollment.id, step_id, now) {
            RetryDecision::Wait => Ok(Transition::ParkHere(now + self.recheck_interval)),
            RetryDecision::Retry { attempt_number } => {
                metrics::counter!("funnel_retries_total").increment(1);
                if let Some(message_id) = retry.retry_message_id {
                    // Nudge resend; the attempt log already dedupes, so no
                    // fired-flag here.
                    let outcome =
                        self.collaborators
                            .dispatcher
                            .send(Channel::Email, &subscriber, message_id);
                    if let DispatchOutcome::Rejected(reason) = outcome {
                        warn!(
                            enrollment_id = %enrollment.id,
                            step_id = %step_id,
                            reason = %reason,
                            "retry nudge rejected"
                        );
                    }
                }
                self.emit(
                    enrollment,
                    EventType::RetryScheduled,
                    Some(step_id),
                    json!({"attempt": attempt_number}),
                );
                Ok(Transition::ParkHere(
                    now + Duration::seconds(retry.interval_seconds()),
                ))
            }
            RetryDecision::Exhausted(action) => {
                self.emit(
                    enrollment,
                    EventType::RetryExhausted,
                    Some(step_id),
                    json!({"action": format!("{:?}", action).to_lowercase()}),
                );
                match action {
                    ExhaustedAction::Continue => Ok(Transition::Goto(next_on_false)),
                    ExhaustedAction::Exit => Ok(Transition::Exit("retry_exhausted")),
                    ExhaustedAction::Unsubscribe => {
                        self.collaborators
                            .audience
                            .unsubscribe(enrollment.subscriber_id, None)?;
                        Ok(Transition::Exit("retry_exhausted_unsubscribed"))
                    }
                }
            }
        }
    }

    /// Fire a message step's dispatch exactly once per (enrollment, step).
    fn dispatch_message(
        &self,
        enrollment: &mut Enrollment,
        step_id: Uuid,
        channel: Channel,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> FunnelResult<()> {
        if enrollment.dispatched_steps.contains(&step_id) {
            debug!(
                enrollment_id = %enrollment.id,
                step_id = %step_id,
                "message already dispatched, skipping"
            );
            return Ok(());
        }
        let subscriber = self.subscriber(enrollment)?;
        let outcome = self
            .collaborators
            .dispatcher
            .send(channel, &subscriber, message_id);
        enrollment.dispatched_steps.insert(step_id);
        match outcome {
            DispatchOutcome::Accepted => {
                metrics::counter!("funnel_messages_dispatched_total").increment(1);
                enrollment.record_history("message_dispatched", json!({"message_id": message_id}), now);
                self.emit(
                    enrollment,
                    EventType::MessageDispatched,
                    Some(step_id),
                    json!({"message_id": message_id}),
                );
            }
            DispatchOutcome::Rejected(reason) => {
                // The provider owns transmission retries; the step still
                // counts as attempted and the graph moves on.
                warn!(
                    enrollment_id = %enrollment.id,
                    step_id = %step_id,
                    reason = %reason,
                    "message dispatch rejected, advancing degraded"
                );
                enrollment.record_history("dispatch_rejected", json!({"reason": reason}), now);
            }
        }
        Ok(())
    }

    fn execute_action(
        &self,
        enrollment: &mut Enrollment,
        step_id: Uuid,
        action: &ActionKind,
        now: DateTime<Utc>,
    ) -> FunnelResult<()> {
        let subscriber_id = enrollment.subscriber_id;
        let audience = &self.collaborators.audience;
        let result: FunnelResult<()> = match action {
            ActionKind::AddTag { tag } => audience.add_tag(subscriber_id, tag),
            ActionKind::RemoveTag { tag } => audience.remove_tag(subscriber_id, tag),
            ActionKind::MoveToList {
                from_list_id,
                to_list_id,
            } => audience.move_to_list(subscriber_id, *from_list_id, *to_list_id),
            ActionKind::CopyToList { list_id } => audience.copy_to_list(subscriber_id, *list_id),
            ActionKind::Unsubscribe { list_id } => audience.unsubscribe(subscriber_id, *list_id),
            ActionKind::Webhook { url, data } => {
                let payload = json!({
                    "funnel_id": enrollment.funnel_id,
                    "subscriber_id": subscriber_id,
                    "step_id": step_id,
                    "data": data.clone().unwrap_or(serde_json::Value::Null),
                });
                if self.collaborators.webhooks.post(url, &payload) {
                    Ok(())
                } else {
                    Err(FunnelError::Storage(format!("webhook post to {} failed", url)))
                }
            }
            ActionKind::Notify { recipient, message } => {
                self.collaborators.notifier.notify(recipient, message);
                Ok(())
            }
        };

        // Failed side effects never block the graph: log degraded and
        // advance.
        match result {
            Ok(()) => {
                metrics::counter!("funnel_actions_total").increment(1);
                enrollment.record_history("action_executed", json!({"step_id": step_id}), now);
                self.emit(enrollment, EventType::ActionExecuted, Some(step_id), json!({}));
            }
            Err(err) => {
                warn!(
                    funnel_id = %enrollment.funnel_id,
                    enrollment_id = %enrollment.id,
                    step_id = %step_id,
                    error = %err,
                    "action failed, advancing degraded"
                );
                enrollment.record_history(
                    "action_failed",
                    json!({"step_id": step_id, "error": err.to_string()}),
                    now,
                );
            }
        }
        Ok(())
    }

    fn subscriber(&self, enrollment: &Enrollment) -> FunnelResult<SubscriberProfile> {
        self.collaborators
            .audience
            .get(enrollment.subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", enrollment.subscriber_id)))
    }

    fn emit(
        &self,
        enrollment: &Enrollment,
        event_type: EventType,
        step_id: Option<Uuid>,
        detail: serde_json::Value,
    ) {
        self.events.emit(make_event(
            event_type,
            enrollment.funnel_id,
            enrollment.id,
            enrollment.subscriber_id,
            step_id,
            detail,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_core::collaborators::{
        CaptureDispatcher, CaptureWebhooks, InMemoryAudience, InMemoryEngagement, LogNotifier,
    };
    use funnel_core::event_bus::{capture_sink, CaptureSink};
    use crate::graph::{Funnel, FunnelGraph, FunnelStep, FunnelTrigger, GoalKind, StepKind};
    use crate::schedule::DelayUnit;

    struct Fixture {
        interpreter: Interpreter,
        store: EnrollmentStore,
        audience: Arc<InMemoryAudience>,
        dispatcher: Arc<CaptureDispatcher>,
        engagement: Arc<InMemoryEngagement>,
        webhooks: Arc<CaptureWebhooks>,
        events: Arc<CaptureSink>,
        splits: Arc<SplitManager>,
    }

    fn fixture() -> Fixture {
        let audience = Arc::new(InMemoryAudience::new());
        let dispatcher = Arc::new(CaptureDispatcher::new());
        let engagement = Arc::new(InMemoryEngagement::new());
        let webhooks = Arc::new(CaptureWebhooks::new());
        let events = capture_sink();
        let splits = Arc::new(SplitManager::new());
        let interpreter = Interpreter::new(
            Collaborators {
                dispatcher: dispatcher.clone(),
                audience: audience.clone(),
                webhooks: webhooks.clone(),
                engagement: engagement.clone(),
                notifier: Arc::new(LogNotifier),
            },
            events.clone(),
            splits.clone(),
            3600,
        );
        Fixture {
            interpreter,
            store: EnrollmentStore::new(120),
            audience,
            dispatcher,
            engagement,
            webhooks,
            events,
            splits,
        }
    }

    fn step(id: Uuid, name: &str, order: u32, kind: StepKind) -> FunnelStep {
        FunnelStep {
            id,
            name: name.to_string(),
            order,
            kind,
        }
    }

    fn graph_of(steps: Vec<FunnelStep>) -> FunnelGraph {
        let mut funnel = Funnel::new(Uuid::new_v4(), "test", FunnelTrigger::Manual);
        funnel.steps = steps;
        FunnelGraph::load(&funnel).unwrap()
    }

    fn enroll(fixture: &Fixture, graph: &FunnelGraph, now: DateTime<Utc>) -> (Uuid, Uuid) {
        let profile = SubscriberProfile::new("journey@example.com");
        let subscriber_id = profile.id;
        fixture.audience.upsert(profile);
        let enrollment = Enrollment::new(graph.funnel_id(), subscriber_id, graph.start_id(), now);
        let enrollment_id = fixture.store.insert(enrollment).unwrap();
        (enrollment_id, subscriber_id)
    }

    #[test]
    fn test_linear_walk_dispatches_once_and_completes() {
        let f = fixture();
        let now = Utc::now();
        let start_id = Uuid::new_v4();
        let email_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: email_id }),
            step(email_id, "Welcome", 1, StepKind::Email { message_id, next: end_id }),
            step(end_id, "End", 2, StepKind::End),
        ]);
        let (enrollment_id, _) = enroll(&f, &graph, now);

        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();

        let enrollment = f.store.get(enrollment_id).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(enrollment.next_action_at.is_none());
        assert!(enrollment.current_step_id.is_none());
        assert_eq!(f.dispatcher.count_message(message_id), 1);
        assert_eq!(f.events.count_type(EventType::MessageDispatched), 1);
        assert_eq!(f.events.count_type(EventType::EnrollmentCompleted), 1);

        // Re-running a completed enrollment is a no-op.
        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();
        assert_eq!(f.dispatcher.count_message(message_id), 1);
    }

    #[test]
    fn test_delay_parks_then_advances_on_wake() {
        let f = fixture();
        let now = Utc::now();
        let start_id = Uuid::new_v4();
        let delay_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: delay_id }),
            step(delay_id, "Wait 2 days", 1, StepKind::Delay {
                value: 2,
                unit: DelayUnit::Days,
                next: end_id,
            }),
            step(end_id, "End", 2, StepKind::End),
        ]);
        let (enrollment_id, _) = enroll(&f, &graph, now);

        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();
        let parked = f.store.get(enrollment_id).unwrap();
        assert_eq!(parked.status, EnrollmentStatus::Waiting);
        assert_eq!(parked.current_step_id, Some(delay_id));
        assert_eq!(parked.next_action_at, Some(now + Duration::days(2)));

        let wake = now + Duration::days(2);
        f.interpreter.run(&graph, &f.store, enrollment_id, wake).unwrap();
        let done = f.store.get(enrollment_id).unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
    }

    #[test]
    fn test_condition_branches_without_waiting() {
        let f = fixture();
        let now = Utc::now();
        let start_id = Uuid::new_v4();
        let cond_id = Uuid::new_v4();
        let tag_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: cond_id }),
            step(cond_id, "Is VIP?", 1, StepKind::Condition {
                predicate: ConditionPredicate::TagExists { tag: "vip".to_string() },
                wait_for_condition: false,
                retry: RetryPolicy::default(),
                next_on_true: tag_id,
                next_on_false: end_id,
            }),
            step(tag_id, "Tag courted", 2, StepKind::Action {
                action: ActionKind::AddTag { tag: "courted".to_string() },
                next: end_id,
            }),
            step(end_id, "End", 3, StepKind::End),
        ]);
        let (enrollment_id, subscriber_id) = enroll(&f, &graph, now);

        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();

        // Not a VIP: the false branch skips the tagging action.
        let enrollment = f.store.get(enrollment_id).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(!f.audience.get(subscriber_id).unwrap().has_tag("courted"));
    }

    #[test]
    fn test_retry_until_exhausted_then_exit() {
        let f = fixture();
        let t0 = Utc::now();
        let start_id = Uuid::new_v4();
        let email_id = Uuid::new_v4();
        let delay_id = Uuid::new_v4();
        let cond_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: email_id }),
            step(email_id, "Offer", 1, StepKind::Email { message_id, next: delay_id }),
            step(delay_id, "Settle", 2, StepKind::Delay {
                value: 2,
                unit: DelayUnit::Days,
                next: cond_id,
            }),
            step(cond_id, "Opened?", 3, StepKind::Condition {
                predicate: ConditionPredicate::EmailOpened { message_id },
                wait_for_condition: true,
                retry: RetryPolicy {
                    enabled: true,
                    max_attempts: 2,
                    interval_value: 24,
                    interval_unit: DelayUnit::Hours,
                    retry_message_id: None,
                    exhausted_action: ExhaustedAction::Exit,
                },
                next_on_true: end_id,
                next_on_false: end_id,
            }),
            step(end_id, "End", 4, StepKind::End),
        ]);
        let (enrollment_id, _) = enroll(&f, &graph, t0);

        // T0: email out, parked on the delay.
        f.interpreter.run(&graph, &f.store, enrollment_id, t0).unwrap();
        assert_eq!(f.dispatcher.count_message(message_id), 1);

        // T0+2d: unopened; first retry attempt, wait 24h.
        let t1 = t0 + Duration::days(2);
        f.interpreter.run(&graph, &f.store, enrollment_id, t1).unwrap();
        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Waiting);
        assert_eq!(e.current_step_id, Some(cond_id));
        assert_eq!(e.next_action_at, Some(t1 + Duration::hours(24)));

        // T0+3d: second attempt.
        let t2 = t1 + Duration::hours(24);
        f.interpreter.run(&graph, &f.store, enrollment_id, t2).unwrap();
        assert_eq!(
            f.interpreter.retries().log().attempt_count(enrollment_id, cond_id),
            2
        );

        // T0+4d: budget spent, journey exits.
        let t3 = t2 + Duration::hours(24);
        f.interpreter.run(&graph, &f.store, enrollment_id, t3).unwrap();
        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Exited);
        assert_eq!(e.exit_reason.as_deref(), Some("retry_exhausted"));
        assert!(e.next_action_at.is_none());
        assert_eq!(f.events.count_type(EventType::RetryExhausted), 1);
    }

    #[test]
    fn test_condition_met_during_retry_takes_true_branch() {
        let f = fixture();
        let t0 = Utc::now();
        let start_id = Uuid::new_v4();
        let cond_id = Uuid::new_v4();
        let tag_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: cond_id }),
            step(cond_id, "Opened?", 1, StepKind::Condition {
                predicate: ConditionPredicate::EmailOpened { message_id },
                wait_for_condition: true,
                retry: RetryPolicy {
                    enabled: true,
                    max_attempts: 3,
                    interval_value: 24,
                    interval_unit: DelayUnit::Hours,
                    retry_message_id: None,
                    exhausted_action: ExhaustedAction::Exit,
                },
                next_on_true: tag_id,
                next_on_false: end_id,
            }),
            step(tag_id, "Tag engaged", 2, StepKind::Action {
                action: ActionKind::AddTag { tag: "engaged".to_string() },
                next: end_id,
            }),
            step(end_id, "End", 3, StepKind::End),
        ]);
        let (enrollment_id, subscriber_id) = enroll(&f, &graph, t0);

        f.interpreter.run(&graph, &f.store, enrollment_id, t0).unwrap();
        assert_eq!(
            f.store.get(enrollment_id).unwrap().status,
            EnrollmentStatus::Waiting
        );

        f.engagement.record_open(subscriber_id, message_id);
        let t1 = t0 + Duration::hours(24);
        f.interpreter.run(&graph, &f.store, enrollment_id, t1).unwrap();

        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(f.audience.get(subscriber_id).unwrap().has_tag("engaged"));
        let attempts = f.interpreter.retries().log().attempts(enrollment_id, cond_id);
        assert!(attempts.iter().all(|a| a.condition_met_at.is_some()));
    }

    #[test]
    fn test_exhausted_unsubscribe_exits_and_unsubscribes() {
        let f = fixture();
        let t0 = Utc::now();
        let start_id = Uuid::new_v4();
        let cond_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: cond_id }),
            step(cond_id, "Clicked?", 1, StepKind::Condition {
                predicate: ConditionPredicate::LinkClicked {
                    url: "https://example.com/renew".to_string(),
                },
                wait_for_condition: true,
                retry: RetryPolicy {
                    enabled: true,
                    max_attempts: 1,
                    interval_value: 1,
                    interval_unit: DelayUnit::Hours,
                    retry_message_id: None,
                    exhausted_action: ExhaustedAction::Unsubscribe,
                },
                next_on_true: end_id,
                next_on_false: end_id,
            }),
            step(end_id, "End", 2, StepKind::End),
        ]);
        let (enrollment_id, subscriber_id) = enroll(&f, &graph, t0);

        f.interpreter.run(&graph, &f.store, enrollment_id, t0).unwrap();
        let t1 = t0 + Duration::hours(1);
        f.interpreter.run(&graph, &f.store, enrollment_id, t1).unwrap();

        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Exited);
        assert!(f.audience.is_unsubscribed(subscriber_id));
    }

    #[test]
    fn test_failed_webhook_advances_degraded() {
        let f = fixture();
        let now = Utc::now();
        f.webhooks.set_failing(true);
        let start_id = Uuid::new_v4();
        let hook_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: hook_id }),
            step(hook_id, "Notify CRM", 1, StepKind::Action {
                action: ActionKind::Webhook {
                    url: "https://crm.example.com/hook".to_string(),
                    data: None,
                },
                next: end_id,
            }),
            step(end_id, "End", 2, StepKind::End),
        ]);
        let (enrollment_id, _) = enroll(&f, &graph, now);

        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();
        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.history.iter().any(|h| h.action == "action_failed"));
    }

    #[test]
    fn test_split_then_goal_credits_variant() {
        let f = fixture();
        let now = Utc::now();
        let start_id = Uuid::new_v4();
        let split_id = Uuid::new_v4();
        let goal_a = Uuid::new_v4();
        let goal_b = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let graph = graph_of(vec![
            step(start_id, "Start", 0, StepKind::Start { next: split_id }),
            step(split_id, "Subject test", 1, StepKind::Split {
                variants: vec![variant("A", 50, goal_a), variant("B", 50, goal_b)],
            }),
            step(goal_a, "Purchase A", 2, StepKind::Goal {
                name: "purchase".to_string(),
                goal_kind: GoalKind::Purchase,
                value: 49.0,
                next: end_id,
            }),
            step(goal_b, "Purchase B", 3, StepKind::Goal {
                name: "purchase".to_string(),
                goal_kind: GoalKind::Purchase,
                value: 49.0,
                next: end_id,
            }),
            step(end_id, "End", 4, StepKind::End),
        ]);
        let (enrollment_id, _) = enroll(&f, &graph, now);

        f.interpreter.run(&graph, &f.store, enrollment_id, now).unwrap();

        let e = f.store.get(enrollment_id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(f.events.count_type(EventType::VariantAssigned), 1);
        assert_eq!(f.events.count_type(EventType::GoalConverted), 1);

        let experiment = f.splits.experiment(split_id).unwrap();
        let enrollments: u64 = experiment.variants.iter().map(|v| v.counters.enrollments).sum();
        let conversions: u64 = experiment.variants.iter().map(|v| v.counters.conversions).sum();
        assert_eq!(enrollments, 1);
        assert_eq!(conversions, 1);
    }

    use crate::enrollment::EnrollmentStatus;
    use funnel_experiments::VariantSpec;

    fn variant(name: &str, weight: u32, next_step_id: Uuid) -> VariantSpec {
        VariantSpec {
            name: name.to_string(),
            weight,
            next_step_id,
        }
    }
}
