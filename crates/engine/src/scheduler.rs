//! Tick driver: invokes a processing pass on a fixed interval, fanning out
//! to the configured number of workers. The interval and restart policy of
//! the driver itself are deployment concerns; the engine only promises
//! that each invocation of `tick` is safe to run concurrently with others
//! thanks to the claim protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use funnel_core::config::EngineConfig;

use crate::engine::{FunnelEngine, PassSummary};

pub struct TickDriver {
    engine: Arc<FunnelEngine>,
    node_id: String,
    interval: Duration,
    workers: usize,
}

impl TickDriver {
    pub fn new(engine: Arc<FunnelEngine>, node_id: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            interval: Duration::from_secs(config.tick_interval_secs),
            workers: config.workers.max(1),
        }
    }

    /// Run passes forever. Callers race this against their shutdown signal.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One tick: all workers sweep the due set in parallel.
    pub async fn tick(&self) -> PassSummary {
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let engine = self.engine.clone();
            let worker_id = format!("{}-w{}", self.node_id, worker);
            handles.push(tokio::task::spawn_blocking(move || {
                engine.run_pass(&worker_id)
            }));
        }

        let mut total = PassSummary::default();
        for handle in handles {
            match handle.await {
                Ok(summary) => {
                    total.selected += summary.selected;
                    total.claimed += summary.claimed;
                    total.advanced += summary.advanced;
                    total.errors += summary.errors;
                }
                Err(err) => {
                    warn!(error = %err, "pass worker panicked");
                    total.errors += 1;
                }
            }
        }
        metrics::counter!("funnel_ticks_total").increment(1);
        debug!(
            claimed = total.claimed,
            advanced = total.advanced,
            "tick finished"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use funnel_core::clock::manual_clock;
    use funnel_core::collaborators::{
        CaptureDispatcher, CaptureWebhooks, InMemoryAudience, InMemoryEngagement, LogNotifier,
    };
    use funnel_core::event_bus::noop_sink;
    use funnel_core::subscriber::SubscriberProfile;

    use crate::enrollment::EnrollmentStatus;
    use crate::graph::{Funnel, FunnelStep, FunnelTrigger, StepKind};
    use crate::interpreter::Collaborators;

    fn engine_with(
        workers: usize,
    ) -> (Arc<FunnelEngine>, Arc<InMemoryAudience>, Arc<CaptureDispatcher>, EngineConfig) {
        let clock = manual_clock(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap());
        let audience = Arc::new(InMemoryAudience::new());
        let dispatcher = Arc::new(CaptureDispatcher::new());
        let config = EngineConfig {
            workers,
            ..EngineConfig::default()
        };
        let engine = Arc::new(FunnelEngine::new(
            config.clone(),
            clock,
            Collaborators {
                dispatcher: dispatcher.clone(),
                audience: audience.clone(),
                webhooks: Arc::new(CaptureWebhooks::new()),
                engagement: Arc::new(InMemoryEngagement::new()),
                notifier: Arc::new(LogNotifier),
            },
            noop_sink(),
        ));
        (engine, audience, dispatcher, config)
    }

    fn one_email_funnel() -> (Funnel, Uuid) {
        let start_id = Uuid::new_v4();
        let email_id = Uuid::new_v4();
        let end_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let mut funnel = Funnel::new(Uuid::new_v4(), "One email", FunnelTrigger::Manual);
        funnel.steps = vec![
            FunnelStep {
                id: start_id,
                name: "Start".to_string(),
                order: 0,
                kind: StepKind::Start { next: email_id },
            },
            FunnelStep {
                id: email_id,
                name: "Email".to_string(),
                order: 1,
                kind: StepKind::Email {
                    message_id,
                    next: end_id,
                },
            },
            FunnelStep {
                id: end_id,
                name: "End".to_string(),
                order: 2,
                kind: StepKind::End,
            },
        ];
        (funnel, message_id)
    }

    #[tokio::test]
    async fn test_tick_advances_due_enrollments() {
        let (engine, audience, dispatcher, config) = engine_with(2);
        let (funnel, message_id) = one_email_funnel();
        let funnel_id = engine.create_funnel(funnel);
        engine.activate(funnel_id).unwrap();

        let profile = SubscriberProfile::new("tick@example.com");
        let subscriber_id = profile.id;
        audience.upsert(profile);
        let enrollment_id = engine.enroll(funnel_id, subscriber_id).unwrap();

        let driver = TickDriver::new(engine.clone(), "node-01", &config);
        let summary = driver.tick().await;

        // Two workers raced; exactly one processed the enrollment.
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.advanced, 1);
        assert_eq!(dispatcher.count_message(message_id), 1);
        assert_eq!(
            engine.enrollment(enrollment_id).unwrap().status,
            EnrollmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_idle_tick_is_a_noop() {
        let (engine, _, _, config) = engine_with(1);
        let driver = TickDriver::new(engine, "node-01", &config);
        let summary = driver.tick().await;
        assert_eq!(summary, PassSummary::default());
    }
}
