//! Dispatch of node names to backends.

use async_trait::async_trait;
use dirsearch_core::error::Error;
use dirsearch_core::node::{DirectoryService, NodeConnection};
use dirsearch_core::Result;
use std::sync::Arc;
use tracing::debug;

/// A [`DirectoryService`] that opens each node on the backend registered under the longest
/// matching node-name prefix.
#[derive(Clone, Default)]
pub struct RoutingDirectory {
    routes: Vec<(String, Arc<dyn DirectoryService>)>,
    fallback: Option<Arc<dyn DirectoryService>>,
}

impl RoutingDirectory {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve node names starting with `prefix` from `backend`. A later route for the same
    /// prefix replaces the earlier one.
    #[must_use]
    pub fn with_route(mut self, prefix: impl Into<String>, backend: Arc<dyn DirectoryService>) -> Self {
        let prefix = prefix.into();
        self.routes.retain(|(existing, _)| *existing != prefix);
        self.routes.push((prefix, backend));
        self.routes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self
    }

    /// Serve every unmatched node name from `backend`.
    #[must_use]
    pub fn with_fallback(mut self, backend: Arc<dyn DirectoryService>) -> Self {
        self.fallback = Some(backend);
        self
    }

    /// Registered prefixes, longest first.
    #[must_use]
    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|(prefix, _)| prefix.as_str()).collect()
    }

    fn backend_for(&self, name: &str) -> Option<&Arc<dyn DirectoryService>> {
        self.routes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend)
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl DirectoryService for RoutingDirectory {
    async fn open_node(&self, name: &str) -> Result<Box<dyn NodeConnection>> {
        let backend = self.backend_for(name).ok_or_else(|| {
            debug!(node = %name, "no backend serves node");
            Error::NodeUnavailable(name.to_string())
        })?;
        backend.open_node(name).await
    }
}
