//! Subscription registry.
//!
//! Routes inbound publishes to the handlers of every subscription whose
//! filter matches the topic. Supports MQTT wildcards: `+` (single level)
//! and `#` (multi-level).

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::topic::validate_filter;
use crate::trie::TopicTrie;
use crate::types::{Handler, QoS};

/// Active subscription.
#[derive(Clone)]
pub struct Subscription {
    /// Topic filter as subscribed.
    pub filter: String,
    /// QoS granted by the broker.
    pub qos: QoS,
    /// Handler invoked for matching publishes. `None` leaves matching
    /// publishes to the client's default handler.
    pub handler: Option<Arc<dyn Handler>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Filter-indexed subscription table.
#[derive(Default)]
pub struct SubscriptionRegistry {
    trie: TopicTrie<Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`. An existing subscription with the
    /// same filter is replaced and returned.
    pub fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<Option<Subscription>> {
        validate_filter(filter)?;
        let replaced = self.trie.insert(
            filter,
            Subscription {
                filter: filter.to_string(),
                qos,
                handler,
            },
        )?;
        if replaced.is_some() {
            debug!("replaced subscription: {}", filter);
        }
        Ok(replaced)
    }

    /// Remove the subscription for exactly `filter`.
    pub fn unsubscribe(&mut self, filter: &str) -> Option<Subscription> {
        self.trie.remove(filter)
    }

    /// Look up a subscription by its filter.
    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.trie.get(filter)
    }

    /// Handlers of every subscription matching `topic`.
    ///
    /// A handler registered under several matching filters appears once.
    /// Subscriptions without a handler contribute nothing.
    pub fn matches(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        let mut seen = HashSet::new();
        self.trie
            .matches(topic)
            .into_iter()
            .filter_map(|sub| sub.handler.as_ref())
            .filter(|handler| seen.insert(Arc::as_ptr(handler) as *const ()))
            .cloned()
            .collect()
    }

    /// Drop every subscription.
    pub fn clear(&mut self) {
        self.trie.clear();
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    /// Returns true if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionRegistry {{ subscriptions: {} }}", self.len())
    }
}
