//! Notifications emitted by the broker.

use dirsearch_core::types::{SearchPolicy, SearchRole};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// Receives broker-level change notifications.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerEvents: Send + Sync {
    /// Downstream lookup caches for `role` should be flushed.
    fn flush_cache(&self, role: SearchRole);

    /// The effective search path of `role` changed.
    fn search_policy_changed(&self, role: SearchRole, policy: SearchPolicy);

    /// A node's reachability flipped.
    fn node_reachability_changed(&self, role: SearchRole, node: &str, reachable: bool);
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl BrokerEvents for LoggingEvents {
    fn flush_cache(&self, role: SearchRole) {
        info!(role = %role, "flushing directory caches");
    }

    fn search_policy_changed(&self, role: SearchRole, policy: SearchPolicy) {
        info!(role = %role, policy = %policy, "search policy changed");
    }

    fn node_reachability_changed(&self, role: SearchRole, node: &str, reachable: bool) {
        info!(role = %role, node = %node, reachable, "node reachability changed");
    }
}

/// A recorded notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// See [`BrokerEvents::flush_cache`].
    FlushCache {
        /// Role
        role: SearchRole,
    },
    /// See [`BrokerEvents::search_policy_changed`].
    SearchPolicyChanged {
        /// Role
        role: SearchRole,
        /// Policy in effect
        policy: SearchPolicy,
    },
    /// See [`BrokerEvents::node_reachability_changed`].
    NodeReachabilityChanged {
        /// Role
        role: SearchRole,
        /// Node name
        node: String,
        /// New state
        reachable: bool,
    },
}

/// Keeps every notification in memory, for hosts that poll and for tests.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<BrokerEvent>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BrokerEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Removes and returns the recorded events.
    pub fn take(&self) -> Vec<BrokerEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    fn push(&self, event: BrokerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl BrokerEvents for EventLog {
    fn flush_cache(&self, role: SearchRole) {
        LoggingEvents.flush_cache(role);
        self.push(BrokerEvent::FlushCache { role });
    }

    fn search_policy_changed(&self, role: SearchRole, policy: SearchPolicy) {
        LoggingEvents.search_policy_changed(role, policy);
        self.push(BrokerEvent::SearchPolicyChanged { role, policy });
    }

    fn node_reachability_changed(&self, role: SearchRole, node: &str, reachable: bool) {
        LoggingEvents.node_reachability_changed(role, node, reachable);
        self.push(BrokerEvent::NodeReachabilityChanged {
            role,
            node: node.to_string(),
            reachable,
        });
    }
}
