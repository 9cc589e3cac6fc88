//! Topic-keyed notification dispatcher.
//!
//! Listeners subscribe to a topic string; `publish` looks up the message's
//! topic and invokes every listener for it, synchronously, in subscription
//! order, on the caller's task. The dispatcher knows nothing about the
//! network: the client is one producer among possibly many.
//!
//! Guarantees:
//!   - A topic with no listeners is a silent no-op.
//!   - A listener that returns an error or panics is counted as a fault and
//!     does not stop delivery to the listeners after it.
//!   - The registry lock is not held while listeners run, so a listener may
//!     subscribe or unsubscribe re-entrantly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::Result;

// =============================================================================
// Message Traits
// =============================================================================

/// Messages that carry their own topic key.
pub trait Topic {
    fn topic(&self) -> &str;
}

/// Delivery metadata handed to listeners alongside the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    /// Type tag of the payload the message was decoded from, if any.
    pub type_tag: Option<String>,
    /// Sender-side timestamp, if the message came off the wire.
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl Context {
    /// Context for a locally generated notification.
    pub fn local() -> Self {
        Self {
            type_tag: None,
            sent_at: None,
            received_at: Utc::now(),
        }
    }
}

/// Receives notifications for the topics it is subscribed to.
pub trait Listener<M>: Send + Sync {
    fn on_notification(&self, topic: &str, message: &M, context: &Context) -> Result<()>;
}

impl<M, F> Listener<M> for F
where
    F: Fn(&str, &M, &Context) -> Result<()> + Send + Sync,
{
    fn on_notification(&self, topic: &str, message: &M, context: &Context) -> Result<()> {
        self(topic, message, context)
    }
}

// =============================================================================
// Subscriber Management
// =============================================================================

/// Subscription receipt for later removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub topic: String,
}

struct Subscriber<M> {
    id: u64,
    listener: Arc<dyn Listener<M>>,
}

/// Statistics about dispatcher usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub published: u64,
    pub delivered: u64,
    pub listener_faults: u64,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Topic registry with ordered, fault-isolated fan-out.
pub struct Dispatcher<M> {
    /// topic -> listeners in subscription order
    topics: RwLock<HashMap<String, Vec<Subscriber<M>>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    listener_faults: AtomicU64,
}

impl<M: Topic> Dispatcher<M> {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            listener_faults: AtomicU64::new(0),
        }
    }

    /// Append `listener` to `topic`'s list.
    ///
    /// The same listener may be subscribed more than once; each subscription
    /// is delivered to separately.
    pub fn subscribe(&self, topic: impl Into<String>, listener: Arc<dyn Listener<M>>) -> Subscription {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.write()
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, listener });

        tracing::debug!(topic = %topic, subscription = id, "listener subscribed");

        Subscription { id, topic }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self.write();
        let Some(subscribers) = topics.get_mut(&subscription.topic) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(&subscription.topic);
        }

        tracing::debug!(topic = %subscription.topic, subscription = subscription.id, removed, "listener unsubscribed");

        removed
    }

    /// Deliver `message` to every listener of its topic.
    ///
    /// Returns the number of listeners that handled it without fault.
    pub fn publish(&self, message: &M, context: &Context) -> usize {
        let topic = message.topic();
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so listeners run without the registry lock.
        let listeners: Vec<Arc<dyn Listener<M>>> = self
            .read()
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.listener.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| {
                listener.on_notification(topic, message, context)
            })) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.listener_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(topic = %topic, error = %e, "listener failed");
                }
                Err(_) => {
                    self.listener_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(topic = %topic, "listener panicked");
                }
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::debug!(topic = %topic, delivered, listeners = listeners.len(), "published notification");

        delivered
    }

    /// Topics that currently have at least one listener.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.read().get(topic).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            listener_faults: self.listener_faults.load(Ordering::Relaxed),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Subscriber<M>>>> {
        self.topics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Subscriber<M>>>> {
        self.topics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: Topic> Default for Dispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Dispatcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = topics.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("Dispatcher").field("topics", &counts).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
