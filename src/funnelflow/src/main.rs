//! FunnelFlow — marketing funnel automation engine.
//!
//! Main entry point: initializes the engine with in-memory collaborators,
//! seeds a demo funnel, and runs the tick driver until shutdown.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use funnel_core::clock::system_clock;
use funnel_core::collaborators::{
    CaptureDispatcher, CaptureWebhooks, InMemoryAudience, InMemoryEngagement, LogNotifier,
};
use funnel_core::config::AppConfig;
use funnel_core::event_bus::noop_sink;
use funnel_core::subscriber::SubscriberProfile;
use funnel_engine::evaluator::ConditionPredicate;
use funnel_engine::retry::{ExhaustedAction, RetryPolicy};
use funnel_engine::schedule::DelayUnit;
use funnel_engine::{
    Collaborators, Funnel, FunnelEngine, FunnelStep, FunnelTrigger, GoalKind, StepKind, TickDriver,
};
use funnel_experiments::VariantSpec;

#[derive(Parser, Debug)]
#[command(name = "funnelflow")]
#[command(about = "Marketing funnel automation engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "FUNNELFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between processing passes (overrides config)
    #[arg(long, env = "FUNNELFLOW__ENGINE__TICK_INTERVAL_SECS")]
    tick_interval: Option<u64>,

    /// Number of parallel pass workers (overrides config)
    #[arg(long, env = "FUNNELFLOW__ENGINE__WORKERS")]
    workers: Option<usize>,

    /// Skip seeding the demo funnel
    #[arg(long, default_value_t = false)]
    no_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnelflow=info,funnel_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("FunnelFlow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.tick_interval {
        config.engine.tick_interval_secs = interval;
    }
    if let Some(workers) = cli.workers {
        config.engine.workers = workers;
    }

    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.engine.tick_interval_secs,
        workers = config.engine.workers,
        batch_size = config.engine.batch_size,
        "Configuration loaded"
    );

    // In-memory collaborators; production embedders wire in real
    // email/SMS providers, CRM hooks, and engagement tracking here.
    let audience = Arc::new(InMemoryAudience::new());
    let engine = Arc::new(FunnelEngine::new(
        config.engine.clone(),
        system_clock(),
        Collaborators {
            dispatcher: Arc::new(CaptureDispatcher::new()),
            audience: audience.clone(),
            webhooks: Arc::new(CaptureWebhooks::new()),
            engagement: Arc::new(InMemoryEngagement::new()),
            notifier: Arc::new(LogNotifier),
        },
        noop_sink(),
    ));

    if !cli.no_seed {
        seed_demo_funnel(&engine, &audience)?;
    }

    let driver = TickDriver::new(engine, &config.node_id, &config.engine);

    info!("FunnelFlow is running");
    tokio::select! {
        _ = driver.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Seed a welcome funnel exercising messages, delays, conditions, a split
/// test, and a goal, plus a handful of demo subscribers.
fn seed_demo_funnel(engine: &FunnelEngine, audience: &InMemoryAudience) -> anyhow::Result<()> {
    let start_id = Uuid::new_v4();
    let welcome_id = Uuid::new_v4();
    let settle_id = Uuid::new_v4();
    let opened_id = Uuid::new_v4();
    let split_id = Uuid::new_v4();
    let offer_a_id = Uuid::new_v4();
    let offer_b_id = Uuid::new_v4();
    let goal_id = Uuid::new_v4();
    let tag_id = Uuid::new_v4();
    let end_id = Uuid::new_v4();

    let welcome_message = Uuid::new_v4();
    let offer_a_message = Uuid::new_v4();
    let offer_b_message = Uuid::new_v4();

    let step = |id: Uuid, name: &str, order: u32, kind: StepKind| FunnelStep {
        id,
        name: name.to_string(),
        order,
        kind,
    };

    let mut funnel = Funnel::new(Uuid::new_v4(), "Welcome series", FunnelTrigger::Manual);
    funnel.steps = vec![
        step(start_id, "Start", 0, StepKind::Start { next: welcome_id }),
        step(welcome_id, "Welcome email", 1, StepKind::Email {
            message_id: welcome_message,
            next: settle_id,
        }),
        step(settle_id, "Let it land", 2, StepKind::Delay {
            value: 2,
            unit: DelayUnit::Days,
            next: opened_id,
        }),
        step(opened_id, "Opened welcome?", 3, StepKind::Condition {
            predicate: ConditionPredicate::EmailOpened {
                message_id: welcome_message,
            },
            wait_for_condition: true,
            retry: RetryPolicy {
                enabled: true,
                max_attempts: 2,
                interval_value: 24,
                interval_unit: DelayUnit::Hours,
                retry_message_id: Some(welcome_message),
                exhausted_action: ExhaustedAction::Continue,
            },
            next_on_true: split_id,
            next_on_false: tag_id,
        }),
        step(split_id, "Offer subject test", 4, StepKind::Split {
            variants: vec![
                VariantSpec {
                    name: "Offer A".to_string(),
                    weight: 50,
                    next_step_id: offer_a_id,
                },
                VariantSpec {
                    name: "Offer B".to_string(),
                    weight: 50,
                    next_step_id: offer_b_id,
                },
            ],
        }),
        step(offer_a_id, "Offer A email", 5, StepKind::Email {
            message_id: offer_a_message,
            next: goal_id,
        }),
        step(offer_b_id, "Offer B email", 6, StepKind::Email {
            message_id: offer_b_message,
            next: goal_id,
        }),
        step(goal_id, "First purchase", 7, StepKind::Goal {
            name: "first_purchase".to_string(),
            goal_kind: GoalKind::Purchase,
            value: 49.0,
            next: end_id,
        }),
        step(tag_id, "Tag cold", 8, StepKind::Action {
            action: funnel_engine::ActionKind::AddTag {
                tag: "cold".to_string(),
            },
            next: end_id,
        }),
        step(end_id, "End", 9, StepKind::End),
    ];

    let funnel_id = engine.create_funnel(funnel);
    engine.activate(funnel_id)?;

    for i in 0..5 {
        let profile = SubscriberProfile::new(format!("demo{}@example.com", i));
        let subscriber_id = profile.id;
        audience.upsert(profile);
        engine.enroll(funnel_id, subscriber_id)?;
    }

    info!(funnel_id = %funnel_id, "Demo funnel seeded with 5 subscribers");
    Ok(())
}
