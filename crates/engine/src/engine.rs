//! Funnel engine facade: funnel lifecycle, enrollment management, trigger
//! handling, and the per-tick pass that claims and advances due
//! enrollments.
//!
//! All state lives in thread-safe in-memory stores behind this facade.
//! Production: back the funnel and enrollment stores with PostgreSQL and
//! keep this API unchanged.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use funnel_core::clock::Clock;
use funnel_core::collaborators::AudienceService;
use funnel_core::config::EngineConfig;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::event_bus::{make_event, EventSink, EventType};
use funnel_experiments::{SplitManager, WinnerDecision};

use crate::enrollment::{Enrollment, EnrollmentStore, StatusCounts};
use crate::graph::{Funnel, FunnelGraph, FunnelStatus, FunnelTrigger};
use crate::interpreter::{Collaborators, Interpreter};

/// Subscriber activity that can enroll into trigger-matched funnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerEvent {
    ListSignup { list_id: Uuid, subscriber_id: Uuid },
    TagAdded { tag: String, subscriber_id: Uuid },
    FormSubmit { form_id: Uuid, subscriber_id: Uuid },
}

/// Per-funnel stats snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStats {
    pub funnel_id: Uuid,
    pub status: FunnelStatus,
    pub counts: StatusCounts,
    pub goal_conversions: u64,
    pub goal_value: f64,
}

/// Outcome of one `run_pass` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub selected: usize,
    pub claimed: usize,
    pub advanced: usize,
    pub errors: usize,
}

pub struct FunnelEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    funnels: DashMap<Uuid, Funnel>,
    /// Validated graphs, materialized at activation and dropped on edit.
    graphs: DashMap<Uuid, FunnelGraph>,
    store: EnrollmentStore,
    interpreter: Interpreter,
    splits: Arc<SplitManager>,
    audience: Arc<dyn AudienceService>,
    events: Arc<dyn EventSink>,
}

impl FunnelEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let splits = Arc::new(SplitManager::new());
        let audience = collaborators.audience.clone();
        let interpreter = Interpreter::new(
            collaborators,
            events.clone(),
            splits.clone(),
            config.recheck_interval_secs,
        );
        Self {
            store: EnrollmentStore::new(config.claim_lease_secs),
            config,
            clock,
            funnels: DashMap::new(),
            graphs: DashMap::new(),
            interpreter,
            splits,
            audience,
            events,
        }
    }

    // ------------------------------------------------------------------
    // Funnel lifecycle
    // ------------------------------------------------------------------

    /// Register a funnel definition in `Draft` status.
    pub fn create_funnel(&self, mut funnel: Funnel) -> Uuid {
        funnel.status = FunnelStatus::Draft;
        let id = funnel.id;
        info!(funnel_id = %id, name = %funnel.name, "funnel created");
        self.funnels.insert(id, funnel);
        id
    }

    pub fn funnel(&self, id: Uuid) -> Option<Funnel> {
        self.funnels.get(&id).map(|f| f.clone())
    }

    pub fn list_funnels(&self) -> Vec<Funnel> {
        self.funnels.iter().map(|f| f.clone()).collect()
    }

    /// Validate the step graph and move the funnel to `Active`.
    /// Configuration errors are surfaced here and the funnel stays out of
    /// rotation, so the interpreter never meets a broken graph.
    pub fn activate(&self, funnel_id: Uuid) -> FunnelResult<()> {
        let mut funnel = self
            .funnels
            .get_mut(&funnel_id)
            .ok_or_else(|| FunnelError::NotFound(format!("funnel {}", funnel_id)))?;
        let graph = FunnelGraph::load(&funnel)?;
        self.graphs.insert(funnel_id, graph);
        funnel.status = FunnelStatus::Active;
        funnel.updated_at = self.clock.now();
        info!(funnel_id = %funnel_id, "funnel activated");
        Ok(())
    }

    /// Pause a funnel: no new trigger enrollments, and all advanceable
    /// enrollments are parked until resume.
    pub fn pause_funnel(&self, funnel_id: Uuid) -> FunnelResult<usize> {
        let now = self.clock.now();
        {
            let mut funnel = self
                .funnels
                .get_mut(&funnel_id)
                .ok_or_else(|| FunnelError::NotFound(format!("funnel {}", funnel_id)))?;
            funnel.status = FunnelStatus::Paused;
            funnel.updated_at = now;
        }
        Ok(self.store.pause_funnel(funnel_id, now))
    }

    pub fn resume_funnel(&self, funnel_id: Uuid) -> FunnelResult<usize> {
        let now = self.clock.now();
        {
            let mut funnel = self
                .funnels
                .get_mut(&funnel_id)
                .ok_or_else(|| FunnelError::NotFound(format!("funnel {}", funnel_id)))?;
            if !self.graphs.contains_key(&funnel_id) {
                let graph = FunnelGraph::load(&funnel)?;
                self.graphs.insert(funnel_id, graph);
            }
            funnel.status = FunnelStatus::Active;
            funnel.updated_at = now;
        }
        let resumed = self.store.resume_funnel(funnel_id, now);
        info!(funnel_id = %funnel_id, resumed = resumed, "funnel resumed");
        Ok(resumed)
    }

    // ------------------------------------------------------------------
    // Enrollments
    // ------------------------------------------------------------------

    /// Enroll a subscriber into an active funnel at its start step.
    pub fn enroll(&self, funnel_id: Uuid, subscriber_id: Uuid) -> FunnelResult<Uuid> {
        let start_id = {
            let funnel = self
                .funnels
                .get(&funnel_id)
                .ok_or_else(|| FunnelError::NotFound(format!("funnel {}", funnel_id)))?;
            if !funnel.is_active() {
                return Err(FunnelError::Config(format!(
                    "funnel {} is not active",
                    funnel_id
                )));
            }
            self.graphs
                .get(&funnel_id)
                .ok_or_else(|| FunnelError::Config(format!("funnel {} has no loaded graph", funnel_id)))?
                .start_id()
        };
        if self.audience.get(subscriber_id).is_none() {
            return Err(FunnelError::NotFound(format!("subscriber {}", subscriber_id)));
        }

        let now = self.clock.now();
        let enrollment = Enrollment::new(funnel_id, subscriber_id, start_id, now);
        let enrollment_id = self.store.insert(enrollment)?;

        if let Some(mut funnel) = self.funnels.get_mut(&funnel_id) {
            funnel.enrolled_count += 1;
        }
        metrics::counter!("funnel_enrollments_total").increment(1);
        self.events.emit(make_event(
            EventType::EnrollmentCreated,
            funnel_id,
            enrollment_id,
            subscriber_id,
            None,
            json!({}),
        ));
        info!(
            funnel_id = %funnel_id,
            enrollment_id = %enrollment_id,
            subscriber_id = %subscriber_id,
            "subscriber enrolled"
        );
        Ok(enrollment_id)
    }

    /// Enroll the subscriber into every active funnel whose trigger matches
    /// the event. Already-enrolled subscribers are skipped.
    pub fn handle_trigger(&self, event: &TriggerEvent) -> Vec<Uuid> {
        let (subscriber_id, matches): (Uuid, Box<dyn Fn(&FunnelTrigger) -> bool>) = match event {
            TriggerEvent::ListSignup {
                list_id,
                subscriber_id,
            } => {
                let list_id = *list_id;
                (*subscriber_id, Box::new(move |t| {
                    matches!(t, FunnelTrigger::ListSignup { list_id: l } if *l == list_id)
                }))
            }
            TriggerEvent::TagAdded { tag, subscriber_id } => {
                let tag = tag.clone();
                (*subscriber_id, Box::new(move |t| {
                    matches!(t, FunnelTrigger::TagAdded { tag: t2 } if *t2 == tag)
                }))
            }
            TriggerEvent::FormSubmit {
                form_id,
                subscriber_id,
            } => {
                let form_id = *form_id;
                (*subscriber_id, Box::new(move |t| {
                    matches!(t, FunnelTrigger::FormSubmit { form_id: f } if *f == form_id)
                }))
            }
        };

        let candidates: Vec<Uuid> = self
            .funnels
            .iter()
            .filter(|f| f.is_active() && matches(&f.trigger))
            .map(|f| f.id)
            .collect();

        let mut enrolled = Vec::new();
        for funnel_id in candidates {
            match self.enroll(funnel_id, subscriber_id) {
                Ok(enrollment_id) => enrolled.push(enrollment_id),
                Err(FunnelError::AlreadyEnrolled { .. }) => {}
                Err(err) => {
                    warn!(
                        funnel_id = %funnel_id,
                        subscriber_id = %subscriber_id,
                        error = %err,
                        "trigger enrollment failed"
                    );
                }
            }
        }
        enrolled
    }

    pub fn enrollment(&self, enrollment_id: Uuid) -> Option<Enrollment> {
        self.store.get(enrollment_id)
    }

    pub fn pause_enrollment(&self, enrollment_id: Uuid) -> FunnelResult<()> {
        let now = self.clock.now();
        self.store.pause_one(enrollment_id, now)?;
        if let Some(enrollment) = self.store.get(enrollment_id) {
            self.events.emit(make_event(
                EventType::EnrollmentPaused,
                enrollment.funnel_id,
                enrollment.id,
                enrollment.subscriber_id,
                enrollment.current_step_id,
                json!({}),
            ));
        }
        Ok(())
    }

    pub fn resume_enrollment(&self, enrollment_id: Uuid) -> FunnelResult<()> {
        let now = self.clock.now();
        self.store.resume_one(enrollment_id, now)?;
        if let Some(enrollment) = self.store.get(enrollment_id) {
            self.events.emit(make_event(
                EventType::EnrollmentResumed,
                enrollment.funnel_id,
                enrollment.id,
                enrollment.subscriber_id,
                enrollment.current_step_id,
                json!({}),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats and experiments
    // ------------------------------------------------------------------

    pub fn funnel_stats(&self, funnel_id: Uuid) -> FunnelResult<FunnelStats> {
        let funnel = self
            .funnels
            .get(&funnel_id)
            .ok_or_else(|| FunnelError::NotFound(format!("funnel {}", funnel_id)))?;
        let counts = self.store.counts_by_status(funnel_id);
        let conversions = self.interpreter.goals().for_funnel(funnel_id);
        let goal_value = conversions.iter().map(|c| c.value).sum();
        Ok(FunnelStats {
            funnel_id,
            status: funnel.status,
            counts,
            goal_conversions: conversions.len() as u64,
            goal_value,
        })
    }

    /// Operator-requested winner declaration for a split step.
    pub fn declare_winner(&self, split_step_id: Uuid) -> Result<WinnerDecision> {
        self.splits.declare_winner(split_step_id, self.clock.now())
    }

    pub fn splits(&self) -> &SplitManager {
        &self.splits
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn store(&self) -> &EnrollmentStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Pass execution
    // ------------------------------------------------------------------

    /// One scheduling pass: select the due set, claim each enrollment,
    /// interpret it, release. One broken enrollment never aborts the batch.
    pub fn run_pass(&self, worker_id: &str) -> PassSummary {
        let now = self.clock.now();
        let due = self.store.due_batch(now, self.config.batch_size);
        let mut summary = PassSummary {
            selected: due.len(),
            ..PassSummary::default()
        };

        for enrollment_id in due {
            if !self.store.try_claim(enrollment_id, worker_id, now) {
                continue;
            }
            summary.claimed += 1;

            match self.advance_one(enrollment_id, now) {
                Ok(()) => summary.advanced += 1,
                Err(err) => {
                    summary.errors += 1;
                    metrics::counter!("funnel_pass_errors_total").increment(1);
                    if let Some(enrollment) = self.store.get(enrollment_id) {
                        error!(
                            funnel_id = %enrollment.funnel_id,
                            enrollment_id = %enrollment_id,
                            step_id = ?enrollment.current_step_id,
                            error = %err,
                            "enrollment advancement failed"
                        );
                    }
                }
            }

            // A lost release must not vanish silently; the lease expiry is
            // the fallback, not the normal path.
            if let Err(err) = self.store.release(enrollment_id) {
                error!(enrollment_id = %enrollment_id, error = %err, "claim release failed");
                summary.errors += 1;
            }
        }

        if summary.selected > 0 {
            info!(
                worker_id = worker_id,
                selected = summary.selected,
                claimed = summary.claimed,
                advanced = summary.advanced,
                errors = summary.errors,
                "pass finished"
            );
        }
        summary
    }

    fn advance_one(&self, enrollment_id: Uuid, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let enrollment = self
            .store
            .get(enrollment_id)
            .ok_or_else(|| anyhow!("enrollment {} disappeared after claim", enrollment_id))?;
        let funnel_id = enrollment.funnel_id;
        let was_completed = enrollment.completed_at.is_some();

        let graph = self
            .graphs
            .get(&funnel_id)
            .ok_or_else(|| anyhow!("no graph loaded for funnel {}", funnel_id))?;
        self.interpreter.run(&graph, &self.store, enrollment_id, now)?;

        if !was_completed {
            if let Some(after) = self.store.get(enrollment_id) {
                if after.completed_at.is_some() {
                    if let Some(mut funnel) = self.funnels.get_mut(&funnel_id) {
                        funnel.completed_count += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use funnel_core::clock::{manual_clock, ManualClock};
    use funnel_core::collaborators::{
        CaptureDispatcher, CaptureWebhooks, InMemoryAudience, InMemoryEngagement, LogNotifier,
    };
    use funnel_core::event_bus::noop_sink;
    use funnel_core::subscriber::SubscriberProfile;
    use chrono::{Duration, TimeZone, Utc};

    use crate::enrollment::EnrollmentStatus;
    use crate::graph::{FunnelStep, StepKind};
    use crate::schedule::DelayUnit;

    struct Harness {
        engine: FunnelEngine,
        clock: Arc<ManualClock>,
        audience: Arc<InMemoryAudience>,
        dispatcher: Arc<CaptureDispatcher>,
    }

    fn harness() -> Harness {
        let clock = manual_clock(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap());
        let audience = Arc::new(InMemoryAudience::new());
        let dispatcher = Arc::new(CaptureDispatcher::new());
        let engine = FunnelEngine::new(
            EngineConfig::default(),
            clock.clone(),
            Collaborators {
                dispatcher: dispatcher.clone(),
                audience: audience.clone(),
                webhooks: Arc::new(CaptureWebhooks::new()),
                engagement: Arc::new(InMemoryEngagement::new()),
                notifier: Arc::new(LogNotifier),
            },
            noop_sink(),
        );
        Harness {
            engine,
            clock,
            audience,
            dispatcher,
        }
    }

    fn subscriber(h: &Harness) -> Uuid {
        let profile = SubscriberProfile::new("pass@example.com");
        let id = profile.id;
        h.audience.upsert(profile);
        id
    }

    fn step(id: Uuid, name: &str, order: u32, kind: StepKind) -> FunnelStep {
        FunnelStep {
            id,
            name: name.to_string(),
            order,
            kind,
        }
    }

    fn delay_funnel(trigger: FunnelTrigger) -> (Funnel, Uuid) {
        let start_id = Uuid::new_v4();
        let email_id = Uuid::new_v4();
        let delay_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let mut funnel = Funnel::new(Uuid::new_v4(), "Welcome", trigger);
        funnel.steps = vec![
            step(start_id, "Start", 0, StepKind::Start { next: email_id }),
            step(email_id, "Welcome email", 1, StepKind::Email {
                message_id,
                next: delay_id,
            }),
            step(delay_id, "Cool off", 2, StepKind::Delay {
                value: 1,
                unit: DelayUnit::Days,
                next: end_id,
            }),
            step(end_id, "End", 3, StepKind::End),
        ];
        (funnel, message_id)
    }

    #[test]
    fn test_enroll_requires_active_funnel() {
        let h = harness();
        let subscriber_id = subscriber(&h);
        let (funnel, _) = delay_funnel(FunnelTrigger::Manual);
        let funnel_id = h.engine.create_funnel(funnel);

        // Draft funnels reject enrollment.
        assert!(h.engine.enroll(funnel_id, subscriber_id).is_err());

        h.engine.activate(funnel_id).unwrap();
        let enrollment_id = h.engine.enroll(funnel_id, subscriber_id).unwrap();
        assert!(h.engine.enrollment(enrollment_id).is_some());

        // Duplicate enrollment rejected.
        let err = h.engine.enroll(funnel_id, subscriber_id).unwrap_err();
        assert!(matches!(err, FunnelError::AlreadyEnrolled { .. }));
    }

    #[test]
    fn test_activation_rejects_broken_graph() {
        let h = harness();
        let (mut funnel, _) = delay_funnel(FunnelTrigger::Manual);
        // Dangle the email step's successor.
        funnel.steps[1].kind = StepKind::Email {
            message_id: Uuid::new_v4(),
            next: Uuid::new_v4(),
        };
        let funnel_id = h.engine.create_funnel(funnel);

        assert!(h.engine.activate(funnel_id).is_err());
        assert_eq!(
            h.engine.funnel(funnel_id).unwrap().status,
            FunnelStatus::Draft
        );
    }

    #[test]
    fn test_pass_advances_and_wakes_on_schedule() {
        let h = harness();
        let subscriber_id = subscriber(&h);
        let (funnel, message_id) = delay_funnel(FunnelTrigger::Manual);
        let funnel_id = h.engine.create_funnel(funnel);
        h.engine.activate(funnel_id).unwrap();
        let enrollment_id = h.engine.enroll(funnel_id, subscriber_id).unwrap();

        let summary = h.engine.run_pass("worker-1");
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.advanced, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(h.dispatcher.count_message(message_id), 1);

        let parked = h.engine.enrollment(enrollment_id).unwrap();
        assert_eq!(parked.status, EnrollmentStatus::Waiting);

        // Nothing due before the wake time.
        h.clock.advance(Duration::hours(12));
        assert_eq!(h.engine.run_pass("worker-1").selected, 0);

        h.clock.advance(Duration::hours(12));
        let summary = h.engine.run_pass("worker-1");
        assert_eq!(summary.advanced, 1);
        let done = h.engine.enrollment(enrollment_id).unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(h.engine.funnel(funnel_id).unwrap().completed_count, 1);
        // No double dispatch across the whole journey.
        assert_eq!(h.dispatcher.count_message(message_id), 1);
    }

    #[test]
    fn test_trigger_enrolls_matching_active_funnels() {
        let h = harness();
        let subscriber_id = subscriber(&h);
        let list_id = Uuid::new_v4();

        let (matching, _) = delay_funnel(FunnelTrigger::ListSignup { list_id });
        let matching_id = h.engine.create_funnel(matching);
        h.engine.activate(matching_id).unwrap();

        let (other_list, _) = delay_funnel(FunnelTrigger::ListSignup {
            list_id: Uuid::new_v4(),
        });
        let other_id = h.engine.create_funnel(other_list);
        h.engine.activate(other_id).unwrap();

        let (dormant, _) = delay_funnel(FunnelTrigger::ListSignup { list_id });
        h.engine.create_funnel(dormant); // stays draft

        let enrolled = h.engine.handle_trigger(&TriggerEvent::ListSignup {
            list_id,
            subscriber_id,
        });
        assert_eq!(enrolled.len(), 1);

        // Replayed trigger does not double-enroll.
        let again = h.engine.handle_trigger(&TriggerEvent::ListSignup {
            list_id,
            subscriber_id,
        });
        assert!(again.is_empty());
    }

    #[test]
    fn test_paused_funnel_leaves_due_set_and_resumes() {
        let h = harness();
        let (funnel, _) = delay_funnel(FunnelTrigger::Manual);
        let funnel_id = h.engine.create_funnel(funnel);
        h.engine.activate(funnel_id).unwrap();

        for _ in 0..3 {
            let subscriber_id = subscriber(&h);
            h.engine.enroll(funnel_id, subscriber_id).unwrap();
        }

        assert_eq!(h.engine.pause_funnel(funnel_id).unwrap(), 3);
        assert_eq!(h.engine.run_pass("worker-1").selected, 0);

        let stats = h.engine.funnel_stats(funnel_id).unwrap();
        assert_eq!(stats.counts.paused, 3);

        assert_eq!(h.engine.resume_funnel(funnel_id).unwrap(), 3);
        let summary = h.engine.run_pass("worker-1");
        assert_eq!(summary.advanced, 3);
    }

    #[test]
    fn test_missing_subscriber_is_isolated_per_enrollment() {
        let h = harness();
        let (funnel, message_id) = delay_funnel(FunnelTrigger::Manual);
        let funnel_id = h.engine.create_funnel(funnel);
        h.engine.activate(funnel_id).unwrap();

        let healthy = subscriber(&h);
        h.engine.enroll(funnel_id, healthy).unwrap();

        // Enroll then delete a subscriber to simulate a broken row.
        let doomed_profile = SubscriberProfile::new("gone@example.com");
        let doomed = doomed_profile.id;
        h.audience.upsert(doomed_profile);
        h.engine.enroll(funnel_id, doomed).unwrap();
        h.audience.remove(doomed);

        let summary = h.engine.run_pass("worker-1");
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.advanced, 1);
        assert_eq!(summary.errors, 1);
        // The healthy journey still got its email.
        assert_eq!(h.dispatcher.count_message(message_id), 1);
    }
}
