//! The search broker.
//!
//! [`Broker`] owns one [`SearchConfig`] per role and every open [`SearchSession`]. The broker
//! lock (the config map mutex) is always taken before any session lock; policy switches never
//! wait on a busy session and instead ask it to abandon its call.

use crate::discovery::{DiscoveryProxy, DiscoveryStatus, NodeDiscovery, StaticDiscovery};
use crate::events::{BrokerEvents, LoggingEvents};
use crate::markers::MarkerFiles;
use crate::persistence::{BlobStore, FsBlobStore};
use crate::plugin::PluginState;
use crate::policy_store::{AugmentConfig, FilePolicyStore, PolicyRecord, PolicyStore};
use crate::routing::RoutingDirectory;
use crate::search_config::SearchConfig;
use crate::session::{PageRequest, SearchPage, SearchSession};
use dirsearch_core::config::BrokerConfig;
use dirsearch_core::error::Error;
use dirsearch_core::ids::{ContinuationId, SessionId};
use dirsearch_core::node::DirectoryService;
use dirsearch_core::query::{AttributeQuery, RecordQuery};
use dirsearch_core::types::{SearchPolicy, SearchRole, LDAP_NODE_PREFIX};
use dirsearch_core::Result;
use dirsearch_ldap::LdapDirectory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use validator::Validate;

/// What `GetNodeInfo` reports for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Role the session searches
    pub role: SearchRole,

    /// Current search path of the role
    pub search_path: Vec<String>,

    /// Policy in effect
    pub policy: SearchPolicy,

    /// Network discovery status
    pub dhcp: DiscoveryStatus,

    /// Nodes currently flagged unreachable
    pub unreachable: Vec<String>,
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    settings: BrokerConfig,
    directory: Option<Arc<dyn DirectoryService>>,
    ldap: Option<LdapDirectory>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    marker_store: Option<Arc<dyn BlobStore>>,
    discovery: Option<Arc<dyn NodeDiscovery>>,
    events: Option<Arc<dyn BrokerEvents>>,
}

impl BrokerBuilder {
    /// Create a new builder from a [`BrokerConfig`].
    #[must_use]
    pub fn new(settings: BrokerConfig) -> Self {
        Self {
            settings,
            directory: None,
            ldap: None,
            policy_store: None,
            marker_store: None,
            discovery: None,
            events: None,
        }
    }

    /// Backend serving every node not routed elsewhere. Required.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Serve `/LDAPv3/` nodes from `ldap`.
    #[must_use]
    pub fn with_ldap_directory(mut self, ldap: LdapDirectory) -> Self {
        self.ldap = Some(ldap);
        self
    }

    /// Override the policy store (defaults to JSON blobs in `policy_dir`).
    #[must_use]
    pub fn with_policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    /// Override where marker blobs live (defaults to `marker_dir`).
    #[must_use]
    pub fn with_marker_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.marker_store = Some(store);
        self
    }

    /// Override node discovery (defaults to the statically configured nodes).
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn NodeDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Override the notification sink (defaults to logging).
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn BrokerEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Finalise the builder and create the [`Broker`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the settings are invalid or no directory was given.
    pub fn build(self) -> Result<Broker> {
        check_settings(&self.settings)?;

        let directory: Arc<dyn DirectoryService> = match (self.directory, self.ldap) {
            (Some(directory), Some(ldap)) => Arc::new(
                RoutingDirectory::new()
                    .with_route(LDAP_NODE_PREFIX, Arc::new(ldap))
                    .with_fallback(directory),
            ),
            (Some(directory), None) => directory,
            (None, Some(ldap)) => Arc::new(RoutingDirectory::new().with_route(LDAP_NODE_PREFIX, Arc::new(ldap))),
            (None, None) => {
                return Err(Error::ConfigError(
                    "a directory backend is required".to_string(),
                ))
            }
        };

        let store = self.policy_store.unwrap_or_else(|| {
            Arc::new(FilePolicyStore::new(Arc::new(FsBlobStore::new(
                self.settings.policy_dir.clone(),
            ))))
        });
        let marker_store = self
            .marker_store
            .unwrap_or_else(|| Arc::new(FsBlobStore::new(self.settings.marker_dir.clone())));
        let discovery = self.discovery.unwrap_or_else(|| {
            Arc::new(StaticDiscovery::new(
                self.settings.discovered_nodes.clone(),
                self.settings.dhcp_ldap_enabled,
            ))
        });
        let discovery = DiscoveryProxy::new(discovery, self.settings.dhcp_ldap_enabled);
        let events = self.events.unwrap_or_else(|| Arc::new(LoggingEvents));

        Ok(Broker {
            settings: Arc::new(self.settings),
            directory,
            store,
            markers: MarkerFiles::new(marker_store),
            discovery,
            events,
            configs: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            state: RwLock::new(PluginState::Inactive),
        })
    }
}

fn check_settings(settings: &BrokerConfig) -> Result<()> {
    settings
        .validate()
        .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;
    let [local, flat_file] = settings.fixed_nodes();
    if local == flat_file {
        return Err(Error::ConfigError(format!(
            "local and flat-file nodes must differ, both are {local}"
        )));
    }
    Ok(())
}

/// Federated directory-search broker.
pub struct Broker {
    settings: Arc<BrokerConfig>,
    directory: Arc<dyn DirectoryService>,
    store: Arc<dyn PolicyStore>,
    markers: MarkerFiles,
    discovery: DiscoveryProxy,
    events: Arc<dyn BrokerEvents>,
    configs: Mutex<HashMap<SearchRole, Arc<SearchConfig>>>,
    sessions: RwLock<HashMap<SessionId, Arc<SearchSession>>>,
    state: RwLock<PluginState>,
}

impl Broker {
    /// Start a builder pre-populated with the provided configuration.
    #[must_use]
    pub fn builder(settings: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(settings)
    }

    /// Broker settings.
    #[must_use]
    pub fn settings(&self) -> &BrokerConfig {
        &self.settings
    }

    /// Loads every role's policy, builds the search paths and starts serving requests.
    ///
    /// Roles already loaded are left untouched.
    ///
    /// # Errors
    ///
    /// Only a failing policy store read that cannot fall back to defaults is returned.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(err) = self.discovery.discover_nodes().await {
            warn!(error = %err, "node discovery failed, using cached nodes");
        }
        let discovered = self.discovery.cached_nodes();

        for role in SearchRole::all() {
            let mut configs = self.configs.lock().await;
            if configs.contains_key(role) {
                continue;
            }
            let record = self.store.load(*role).await?;
            let config = SearchConfig::new(
                *role,
                Arc::clone(&self.settings),
                &record,
                &discovered,
                Arc::clone(&self.directory),
                Arc::clone(&self.events),
            );
            info!(
                role = %role,
                policy = %record.policy,
                nodes = config.node_names().len(),
                "search configuration loaded"
            );
            configs.insert(*role, config);
            drop(configs);

            if let Err(err) = self.markers.set_active(*role, record.policy).await {
                warn!(role = %role, error = %err, "failed to write policy marker");
            }
        }

        self.set_state(PluginState::Active);
        Ok(())
    }

    /// Current plugin state.
    #[must_use]
    pub fn state(&self) -> PluginState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts or stops accepting requests.
    pub fn set_state(&self, state: PluginState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            info!(from = ?*current, to = ?state, "broker state changed");
            *current = state;
        }
    }

    /// Opens a search session on `target` (e.g. `/Search`).
    ///
    /// # Errors
    ///
    /// * [`Error::ServiceUnavailable`] while the broker is inactive
    /// * [`Error::UnknownTarget`] for an unregistered target name
    /// * [`Error::SearchPathNotConfigured`] if the role was never initialized
    pub async fn open_search(&self, target: &str, caller_uid: u32) -> Result<SessionId> {
        self.ensure_active()?;
        let role = SearchRole::from_target_name(target)?;

        // registered under the broker lock so a concurrent switch sees the session
        let configs = self.configs.lock().await;
        let config = configs
            .get(&role)
            .cloned()
            .ok_or_else(|| Error::SearchPathNotConfigured(target.to_string()))?;
        let session = Arc::new(SearchSession::new(config, caller_uid));
        let id = session.id();
        self.write_sessions().insert(id, session);
        drop(configs);

        debug!(session = %id, role = %role, caller_uid, "search session opened");
        Ok(id)
    }

    /// Closes a session, releasing its continuations and node handles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the session is unknown.
    pub async fn close_search(&self, session: SessionId) -> Result<()> {
        let removed = self.write_sessions().remove(&session);
        let session = removed.ok_or_else(|| Error::InvalidSession(session.to_string()))?;
        session.close().await;
        Ok(())
    }

    /// Lists records across the session's search path.
    ///
    /// # Errors
    ///
    /// See [`SearchSession::get_record_list`].
    pub async fn get_record_list(
        &self,
        session: SessionId,
        query: RecordQuery,
        page: PageRequest,
    ) -> Result<SearchPage> {
        self.ensure_active()?;
        self.session(session)?.get_record_list(query, page).await
    }

    /// Searches by attribute value across the session's search path.
    ///
    /// # Errors
    ///
    /// See [`SearchSession::search_by_attribute_value`].
    pub async fn search_by_attribute_value(
        &self,
        session: SessionId,
        query: AttributeQuery,
        page: PageRequest,
    ) -> Result<SearchPage> {
        self.ensure_active()?;
        self.session(session)?
            .search_by_attribute_value(query, page)
            .await
    }

    /// Drops a continuation the caller will not resume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] or [`Error::InvalidContext`] for unknown handles.
    pub async fn release_continuation(
        &self,
        session: SessionId,
        continuation: ContinuationId,
    ) -> Result<()> {
        self.session(session)?
            .release_continuation(continuation)
            .await
    }

    /// Node a parked continuation resumes on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the session is unknown.
    pub async fn continuation_node(
        &self,
        session: SessionId,
        continuation: ContinuationId,
    ) -> Result<Option<String>> {
        Ok(self
            .session(session)?
            .continuation_node(continuation)
            .await)
    }

    /// Search path, policy and discovery status seen by a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the session is unknown.
    pub async fn get_node_info(&self, session: SessionId) -> Result<NodeInfo> {
        self.ensure_active()?;
        let role = self.session(session)?.role();
        let config = self.config(role).await?;
        Ok(NodeInfo {
            role,
            search_path: config.node_names(),
            policy: config.policy(),
            dhcp: self.discovery.status(),
            unreachable: config.unreachable_nodes(),
        })
    }

    /// Switches `role` to `policy`. Returns whether the role's node list changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] while inactive and
    /// [`Error::SearchPathNotConfigured`] for an uninitialized role. Persistence failures are
    /// logged, not returned.
    pub async fn set_policy(&self, role: SearchRole, policy: SearchPolicy) -> Result<bool> {
        self.ensure_active()?;
        self.switch(role, policy, None).await
    }

    /// Replaces the custom node list of `role`.
    ///
    /// On the Custom policy the path is switched at once, and when a node is unreachable the
    /// call waits, bounded by `policy_switch_wait_secs`, for one probe pass. Returns whether
    /// the node list changed.
    ///
    /// # Errors
    ///
    /// As [`Self::set_policy`].
    pub async fn set_custom_nodes(&self, role: SearchRole, nodes: Vec<String>) -> Result<bool> {
        self.ensure_active()?;
        let config = self.config(role).await?;
        let seen = config.prober().passes_completed();
        let policy = config.policy();
        let changed = self.switch(role, policy, Some(nodes)).await?;

        if policy == SearchPolicy::Custom && !config.unreachable_nodes().is_empty() {
            config.ensure_prober();
            let wait = self.settings.policy_switch_wait();
            if !config.prober().wait_for_pass(seen, wait).await {
                debug!(role = %role, ?wait, "no probe pass finished in time");
            }
        }
        Ok(changed)
    }

    /// Replaces the augmentation settings of `role`. Live sessions pick them up on their
    /// next call.
    ///
    /// # Errors
    ///
    /// As [`Self::set_policy`].
    pub async fn set_augmentation(&self, role: SearchRole, augmentation: AugmentConfig) -> Result<()> {
        self.ensure_active()?;
        let record = {
            let configs = self.configs.lock().await;
            let config = lookup(&configs, role)?;
            config.set_augmentation(augmentation);
            self.invalidate_sessions(role);
            config.policy_record()
        };
        self.persist(role, &record).await;
        self.events.flush_cache(role);
        Ok(())
    }

    /// Augmentation settings of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchPathNotConfigured`] for an uninitialized role.
    pub async fn augmentation(&self, role: SearchRole) -> Result<AugmentConfig> {
        Ok(self.config(role).await?.augmentation())
    }

    /// Nodes of `role` currently flagged unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchPathNotConfigured`] for an uninitialized role.
    pub async fn get_unreachable_nodes(&self, role: SearchRole) -> Result<Vec<String>> {
        Ok(self.config(role).await?.unreachable_nodes())
    }

    /// Current policy of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchPathNotConfigured`] for an uninitialized role.
    pub async fn policy(&self, role: SearchRole) -> Result<SearchPolicy> {
        Ok(self.config(role).await?.policy())
    }

    /// Current search path of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchPathNotConfigured`] for an uninitialized role.
    pub async fn search_path(&self, role: SearchRole) -> Result<Vec<String>> {
        Ok(self.config(role).await?.node_names())
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    /// Reacts to a network change: refreshes discovery and wakes every prober.
    pub async fn network_transition(&self) {
        if let Err(err) = self.refresh_discovery().await {
            warn!(error = %err, "node discovery failed after network change");
        }
        let configs: Vec<Arc<SearchConfig>> = self.configs.lock().await.values().cloned().collect();
        for config in configs {
            config.prober().network_transition();
            config.ensure_prober();
        }
    }

    /// Re-runs node discovery and re-switches Automatic roles when the discovered set changed.
    /// Returns whether it changed.
    ///
    /// # Errors
    ///
    /// Returns the discovery error; the previous node set stays in use.
    pub async fn refresh_discovery(&self) -> Result<bool> {
        let before = self.discovery.cached_nodes();
        let after = self.discovery.discover_nodes().await?;
        if before == after {
            return Ok(false);
        }
        info!(nodes = after.len(), "discovered node set changed");
        if !self.settings.dhcp_ldap_enabled {
            return Ok(true);
        }

        let roles: Vec<SearchRole> = {
            let configs = self.configs.lock().await;
            configs
                .iter()
                .filter(|(_, config)| config.policy() == SearchPolicy::Automatic)
                .map(|(role, _)| *role)
                .collect()
        };
        for role in roles {
            self.switch(role, SearchPolicy::Automatic, None).await?;
        }
        Ok(true)
    }

    /// Checks the settings the broker was built with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] for invalid settings.
    pub fn validate(&self) -> Result<()> {
        check_settings(&self.settings)
    }

    /// Housekeeping: refreshes discovery and restarts probers of roles with unreachable
    /// nodes.
    pub async fn periodic_task(&self) {
        if self.state() != PluginState::Active {
            return;
        }
        if let Err(err) = self.refresh_discovery().await {
            warn!(error = %err, "periodic node discovery failed");
        }
        let configs: Vec<Arc<SearchConfig>> = self.configs.lock().await.values().cloned().collect();
        for config in configs {
            if config.ensure_prober() {
                debug!(role = %config.role(), "restarted reachability prober");
            }
        }
    }

    /// Stops every prober and closes every session. The broker stays inactive afterwards.
    pub async fn shutdown(&self) {
        self.set_state(PluginState::Inactive);
        for config in self.configs.lock().await.values() {
            config.prober().stop();
        }
        let sessions: Vec<Arc<SearchSession>> = self
            .write_sessions()
            .drain()
            .map(|(_, session)| session)
            .collect();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!(sessions = count, "broker shut down");
    }

    async fn switch(
        &self,
        role: SearchRole,
        policy: SearchPolicy,
        custom_nodes: Option<Vec<String>>,
    ) -> Result<bool> {
        let discovered = self.discovery.cached_nodes();
        let (changed, record, old_path, config) = {
            let configs = self.configs.lock().await;
            let config = lookup(&configs, role)?;
            if let Some(nodes) = custom_nodes {
                config.set_custom_nodes(nodes);
            }
            let (changed, old_path) = config.apply_policy(policy, &discovered);
            self.invalidate_sessions(role);
            (changed, config.policy_record(), old_path, config)
        };
        debug!(role = %role, nodes = old_path.len(), "released previous search path");
        drop(old_path);

        self.persist(role, &record).await;
        if let Err(err) = self.markers.set_active(role, policy).await {
            warn!(role = %role, error = %err, "failed to write policy marker");
        }
        if changed {
            info!(
                role = %role,
                policy = %policy,
                path = ?config.node_names(),
                "search path changed"
            );
            self.events.flush_cache(role);
            self.events.search_policy_changed(role, policy);
        }
        config.ensure_prober();
        Ok(changed)
    }

    async fn persist(&self, role: SearchRole, record: &PolicyRecord) {
        if let Err(err) = self.store.save(role, record).await {
            warn!(role = %role, error = %err, "failed to save search policy");
        }
    }

    fn invalidate_sessions(&self, role: SearchRole) {
        for session in self.read_sessions().values() {
            if session.role() == role {
                session.invalidate();
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            PluginState::Active => Ok(()),
            PluginState::Inactive => Err(Error::ServiceUnavailable(
                "directory search is inactive".to_string(),
            )),
        }
    }

    async fn config(&self, role: SearchRole) -> Result<Arc<SearchConfig>> {
        lookup(&*self.configs.lock().await, role)
    }

    fn session(&self, id: SessionId) -> Result<Arc<SearchSession>> {
        self.read_sessions()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidSession(id.to_string()))
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<SearchSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<SearchSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lookup(
    configs: &HashMap<SearchRole, Arc<SearchConfig>>,
    role: SearchRole,
) -> Result<Arc<SearchConfig>> {
    configs
        .get(&role)
        .cloned()
        .ok_or_else(|| Error::SearchPathNotConfigured(role.target_name().to_string()))
}
