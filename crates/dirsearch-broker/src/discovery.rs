//! Network node discovery.
//!
//! The Automatic policy adds network-discovered LDAP nodes to a search path. Discovery itself
//! is pluggable; [`DiscoveryProxy`] wraps any implementation to track a [`DiscoveryStatus`] that
//! is reported as the DHCP-LDAP status in node info.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirsearch_core::error::Error;
use dirsearch_core::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Health of node discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiscoveryStatus {
    /// Whether discovered nodes are used at all
    pub enabled: bool,

    /// When discovery was last attempted
    pub last_discovery_at: Option<DateTime<Utc>>,

    /// When discovery last succeeded
    pub last_success_at: Option<DateTime<Utc>>,

    /// Last error message, if any
    pub last_error: Option<String>,

    /// Nodes found by the last successful discovery
    pub discovered_nodes: Vec<String>,
}

impl DiscoveryStatus {
    /// Create a new discovery status.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_discovery_at: None,
            last_success_at: None,
            last_error: None,
            discovered_nodes: Vec::new(),
        }
    }

    /// Record a successful discovery.
    #[must_use]
    pub fn with_success(mut self, nodes: Vec<String>) -> Self {
        let now = Utc::now();
        self.last_discovery_at = Some(now);
        self.last_success_at = Some(now);
        self.discovered_nodes = nodes;
        self.last_error = None;
        self
    }

    /// Record a failed discovery. The last good node list is kept.
    #[must_use]
    pub fn with_error(mut self, error: String) -> Self {
        self.last_discovery_at = Some(Utc::now());
        self.last_error = Some(error);
        self
    }

    /// Check if discovery is healthy (no recent errors).
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }
}

/// Finds network directory nodes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeDiscovery: Send + Sync {
    /// Discover the currently advertised nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails.
    async fn discover_nodes(&self) -> Result<Vec<String>>;

    /// Get the current discovery status.
    fn status(&self) -> DiscoveryStatus;

    /// Clear any cached discovery data.
    fn clear_cache(&self);
}

/// Discovery returning a fixed node list.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    nodes: Vec<String>,
    enabled: bool,
}

impl StaticDiscovery {
    /// Create a discovery that always reports `nodes`.
    #[must_use]
    pub fn new(nodes: Vec<String>, enabled: bool) -> Self {
        Self { nodes, enabled }
    }
}

#[async_trait]
impl NodeDiscovery for StaticDiscovery {
    async fn discover_nodes(&self) -> Result<Vec<String>> {
        Ok(self.nodes.clone())
    }

    fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus::new(self.enabled).with_success(self.nodes.clone())
    }

    fn clear_cache(&self) {}
}

/// Discovery proxy that records status and keeps the last good node list.
#[derive(Clone)]
pub struct DiscoveryProxy {
    inner: Arc<dyn NodeDiscovery>,
    status: Arc<RwLock<DiscoveryStatus>>,
}

impl DiscoveryProxy {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn NodeDiscovery>, enabled: bool) -> Self {
        Self {
            inner,
            status: Arc::new(RwLock::new(DiscoveryStatus::new(enabled))),
        }
    }

    /// Nodes found by the last successful discovery.
    #[must_use]
    pub fn cached_nodes(&self) -> Vec<String> {
        self.status
            .read()
            .map(|status| status.discovered_nodes.clone())
            .unwrap_or_default()
    }

    fn record_success(&self, nodes: &[String]) {
        if let Ok(mut status) = self.status.write() {
            *status = status.clone().with_success(nodes.to_vec());
        }
    }

    fn record_error(&self, error: &Error) {
        if let Ok(mut status) = self.status.write() {
            *status = status.clone().with_error(error.to_string());
        }
    }
}

#[async_trait]
impl NodeDiscovery for DiscoveryProxy {
    async fn discover_nodes(&self) -> Result<Vec<String>> {
        match self.inner.discover_nodes().await {
            Ok(nodes) => {
                self.record_success(&nodes);
                Ok(nodes)
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    fn status(&self) -> DiscoveryStatus {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    fn clear_cache(&self) {
        self.inner.clear_cache();
        if let Ok(mut status) = self.status.write() {
            status.discovered_nodes.clear();
        }
    }
}
