//! Collaborator contracts consumed by the funnel engine.
//!
//! The engine never renders or transmits anything itself: message sending,
//! tag/list mutations, webhooks, and engagement facts all go through these
//! narrow traits. In-memory implementations are provided for development
//! and testing; production embedders wire in real providers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FunnelError, FunnelResult};
use crate::subscriber::SubscriberProfile;

/// Delivery channel for message steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

/// Outcome of handing a message to the dispatch collaborator. `Accepted`
/// means the step effect fired; eventual delivery is observed later via
/// engagement facts, not via this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Rejected(String),
}

/// Messaging dispatch: hands a (subscriber, message) pair to the channel
/// provider. Must be cheap; retry/backoff of the actual transmission is
/// the provider's concern.
pub trait MessageDispatcher: Send + Sync {
    fn send(
        &self,
        channel: Channel,
        subscriber: &SubscriberProfile,
        message_id: Uuid,
    ) -> DispatchOutcome;
}

/// Tag/list service: idempotent subscriber mutations keyed by subscriber id,
/// plus profile lookup for the interpreter and condition evaluator.
pub trait AudienceService: Send + Sync {
    fn get(&self, subscriber_id: Uuid) -> Option<SubscriberProfile>;
    fn add_tag(&self, subscriber_id: Uuid, tag: &str) -> FunnelResult<()>;
    fn remove_tag(&self, subscriber_id: Uuid, tag: &str) -> FunnelResult<()>;
    fn move_to_list(&self, subscriber_id: Uuid, from_list: Uuid, to_list: Uuid)
        -> FunnelResult<()>;
    fn copy_to_list(&self, subscriber_id: Uuid, list_id: Uuid) -> FunnelResult<()>;
    fn unsubscribe(&self, subscriber_id: Uuid, list_id: Option<Uuid>) -> FunnelResult<()>;
}

/// Webhook dispatch with its own retry/backoff; the engine only needs the
/// boolean success signal.
pub trait WebhookDispatcher: Send + Sync {
    fn post(&self, url: &str, payload: &serde_json::Value) -> bool;
}

/// Read-only source of engagement and external-task facts, keyed by
/// (subscriber, message/task). Safe to query repeatedly.
pub trait EngagementSource: Send + Sync {
    fn email_opened(&self, subscriber_id: Uuid, message_id: Uuid) -> bool;
    fn email_clicked(&self, subscriber_id: Uuid, message_id: Uuid) -> bool;
    fn link_clicked(&self, subscriber_id: Uuid, url: &str) -> bool;
    fn task_completed(&self, funnel_id: Uuid, subscriber_id: Uuid, task_id: Uuid) -> bool;
}

/// Operator notification channel for `notify` action steps.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: &str, message: &str);
}

// ---------------------------------------------------------------------------
// In-memory implementations (development + tests)
// ---------------------------------------------------------------------------

/// In-memory subscriber directory implementing [`AudienceService`].
#[derive(Default)]
pub struct InMemoryAudience {
    profiles: DashMap<Uuid, SubscriberProfile>,
    unsubscribed: DashMap<Uuid, DateTime<Utc>>,
}

impl InMemoryAudience {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: SubscriberProfile) {
        self.profiles.insert(profile.id, profile);
    }

    pub fn remove(&self, subscriber_id: Uuid) {
        self.profiles.remove(&subscriber_id);
    }

    pub fn is_unsubscribed(&self, subscriber_id: Uuid) -> bool {
        self.unsubscribed.contains_key(&subscriber_id)
    }
}

impl AudienceService for InMemoryAudience {
    fn get(&self, subscriber_id: Uuid) -> Option<SubscriberProfile> {
        self.profiles.get(&subscriber_id).map(|p| p.clone())
    }

    fn add_tag(&self, subscriber_id: Uuid, tag: &str) -> FunnelResult<()> {
        let mut profile = self
            .profiles
            .get_mut(&subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", subscriber_id)))?;
        profile.tags.insert(tag.to_string());
        Ok(())
    }

    fn remove_tag(&self, subscriber_id: Uuid, tag: &str) -> FunnelResult<()> {
        let mut profile = self
            .profiles
            .get_mut(&subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", subscriber_id)))?;
        profile.tags.remove(tag);
        Ok(())
    }

    fn move_to_list(
        &self,
        subscriber_id: Uuid,
        from_list: Uuid,
        to_list: Uuid,
    ) -> FunnelResult<()> {
        let mut profile = self
            .profiles
            .get_mut(&subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", subscriber_id)))?;
        profile.lists.remove(&from_list);
        profile.lists.insert(to_list);
        Ok(())
    }

    fn copy_to_list(&self, subscriber_id: Uuid, list_id: Uuid) -> FunnelResult<()> {
        let mut profile = self
            .profiles
            .get_mut(&subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", subscriber_id)))?;
        profile.lists.insert(list_id);
        Ok(())
    }

    fn unsubscribe(&self, subscriber_id: Uuid, list_id: Option<Uuid>) -> FunnelResult<()> {
        let mut profile = self
            .profiles
            .get_mut(&subscriber_id)
            .ok_or_else(|| FunnelError::NotFound(format!("subscriber {}", subscriber_id)))?;
        match list_id {
            Some(list) => {
                profile.lists.remove(&list);
            }
            None => profile.lists.clear(),
        }
        self.unsubscribed.insert(subscriber_id, Utc::now());
        info!(subscriber_id = %subscriber_id, "subscriber unsubscribed");
        Ok(())
    }
}

/// One recorded dispatch, for assertion in tests.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub channel: Channel,
    pub subscriber_id: Uuid,
    pub message_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Dispatcher that records every send instead of transmitting.
#[derive(Default)]
pub struct CaptureDispatcher {
    sends: Mutex<Vec<DispatchRecord>>,
    rejecting: AtomicBool,
}

impl CaptureDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends come back `Rejected`.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<DispatchRecord> {
        self.sends.lock().expect("dispatcher mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.sends.lock().expect("dispatcher mutex poisoned").len()
    }

    pub fn count_message(&self, message_id: Uuid) -> usize {
        self.sends
            .lock()
            .expect("dispatcher mutex poisoned")
            .iter()
            .filter(|r| r.message_id == message_id)
            .count()
    }
}

impl MessageDispatcher for CaptureDispatcher {
    fn send(
        &self,
        channel: Channel,
        subscriber: &SubscriberProfile,
        message_id: Uuid,
    ) -> DispatchOutcome {
        if self.rejecting.load(Ordering::SeqCst) {
            return DispatchOutcome::Rejected("provider unavailable".to_string());
        }
        self.sends
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(DispatchRecord {
                channel,
                subscriber_id: subscriber.id,
                message_id,
                at: Utc::now(),
            });
        DispatchOutcome::Accepted
    }
}

/// Webhook dispatcher that records posts instead of making HTTP calls.
#[derive(Default)]
pub struct CaptureWebhooks {
    posts: Mutex<Vec<(String, serde_json::Value)>>,
    failing: AtomicBool,
}

impl CaptureWebhooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn posts(&self) -> Vec<(String, serde_json::Value)> {
        self.posts.lock().expect("webhook mutex poisoned").clone()
    }
}

impl WebhookDispatcher for CaptureWebhooks {
    fn post(&self, url: &str, payload: &serde_json::Value) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            warn!(url = %url, "webhook post failed");
            return false;
        }
        self.posts
            .lock()
            .expect("webhook mutex poisoned")
            .push((url.to_string(), payload.clone()));
        true
    }
}

/// In-memory engagement fact store. Tracking pixels / click redirects /
/// task completion endpoints record into this; the evaluator reads from it.
#[derive(Default)]
pub struct InMemoryEngagement {
    opens: DashMap<(Uuid, Uuid), DateTime<Utc>>,
    clicks: DashMap<(Uuid, Uuid), DateTime<Utc>>,
    link_clicks: DashMap<(Uuid, String), DateTime<Utc>>,
    completed_tasks: DashMap<(Uuid, Uuid, Uuid), DateTime<Utc>>,
}

impl InMemoryEngagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&self, subscriber_id: Uuid, message_id: Uuid) {
        self.opens.insert((subscriber_id, message_id), Utc::now());
    }

    pub fn record_click(&self, subscriber_id: Uuid, message_id: Uuid) {
        self.clicks.insert((subscriber_id, message_id), Utc::now());
    }

    pub fn record_link_click(&self, subscriber_id: Uuid, url: impl Into<String>) {
        self.link_clicks.insert((subscriber_id, url.into()), Utc::now());
    }

    pub fn complete_task(&self, funnel_id: Uuid, subscriber_id: Uuid, task_id: Uuid) {
        self.completed_tasks
            .insert((funnel_id, subscriber_id, task_id), Utc::now());
    }
}

impl EngagementSource for InMemoryEngagement {
    fn email_opened(&self, subscriber_id: Uuid, message_id: Uuid) -> bool {
        self.opens.contains_key(&(subscriber_id, message_id))
    }

    fn email_clicked(&self, subscriber_id: Uuid, message_id: Uuid) -> bool {
        self.clicks.contains_key(&(subscriber_id, message_id))
    }

    fn link_clicked(&self, subscriber_id: Uuid, url: &str) -> bool {
        self.link_clicks
            .contains_key(&(subscriber_id, url.to_string()))
    }

    fn task_completed(&self, funnel_id: Uuid, subscriber_id: Uuid, task_id: Uuid) -> bool {
        self.completed_tasks
            .contains_key(&(funnel_id, subscriber_id, task_id))
    }
}

/// Notifier that writes to the log. Production embedders replace this with
/// an email/Slack bridge.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient: &str, message: &str) {
        info!(recipient = %recipient, message = %message, "operator notification");
    }
}
