//! Per-role search configuration.
//!
//! A [`SearchConfig`] owns the current [`SearchPath`] of one role together with its policy,
//! custom nodes and augmentation settings. Sessions read reachability from it by node name, so
//! a recovery seen by the prober reaches every live session without a rebuild.

use crate::events::BrokerEvents;
use crate::path::SearchPath;
use crate::policy_store::{AugmentConfig, PolicyRecord, POLICY_VERSION};
use crate::prober::{ProbeOutcome, ProbeTarget, ReachabilityProber};
use async_trait::async_trait;
use chrono::Utc;
use dirsearch_core::config::BrokerConfig;
use dirsearch_core::error::Error;
use dirsearch_core::node::DirectoryService;
use dirsearch_core::types::{is_ldap_node, SearchPolicy, SearchRole};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ConfigState {
    policy: SearchPolicy,
    custom_nodes: Vec<String>,
    augmentation: AugmentConfig,
    path: SearchPath,
    generation: u64,
}

/// What a session copies when it (re)builds its private node list.
#[derive(Debug, Clone)]
pub(crate) struct SessionView {
    pub names: Vec<String>,
    pub generation: u64,
    pub augmentation: AugmentConfig,
}

/// Search configuration of one role.
pub struct SearchConfig {
    role: SearchRole,
    settings: Arc<BrokerConfig>,
    state: RwLock<ConfigState>,
    prober: Arc<ReachabilityProber>,
    directory: Arc<dyn DirectoryService>,
    events: Arc<dyn BrokerEvents>,
}

impl SearchConfig {
    /// Builds the configuration of `role` from its stored policy.
    #[must_use]
    pub fn new(
        role: SearchRole,
        settings: Arc<BrokerConfig>,
        record: &PolicyRecord,
        discovered: &[String],
        directory: Arc<dyn DirectoryService>,
        events: Arc<dyn BrokerEvents>,
    ) -> Arc<Self> {
        let path = compute_path(&settings, record.policy, &record.custom_nodes, discovered);
        let prober = Arc::new(ReachabilityProber::new(role, settings.probe_backoff()));
        Arc::new(Self {
            role,
            settings,
            state: RwLock::new(ConfigState {
                policy: record.policy,
                custom_nodes: record.custom_nodes.clone(),
                augmentation: record.augmentation.clone(),
                path,
                generation: 0,
            }),
            prober,
            directory,
            events,
        })
    }

    /// Role served.
    #[must_use]
    pub const fn role(&self) -> SearchRole {
        self.role
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> SearchPolicy {
        self.read_state().policy
    }

    /// Custom node list.
    #[must_use]
    pub fn custom_nodes(&self) -> Vec<String> {
        self.read_state().custom_nodes.clone()
    }

    /// Augmentation settings.
    #[must_use]
    pub fn augmentation(&self) -> AugmentConfig {
        self.read_state().augmentation.clone()
    }

    /// Copy of the current path.
    #[must_use]
    pub fn path_snapshot(&self) -> SearchPath {
        self.read_state().path.clone()
    }

    /// Node names of the current path.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.read_state().path.names()
    }

    /// Generation of the current path; bumped on every swap.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.read_state().generation
    }

    /// Whether a node may be tried.
    #[must_use]
    pub fn is_reachable(&self, name: &str) -> bool {
        self.read_state().path.is_reachable(name)
    }

    /// Non-fixed nodes flagged unreachable.
    #[must_use]
    pub fn unreachable_nodes(&self) -> Vec<String> {
        self.read_state().path.unreachable_names()
    }

    /// Returns true if `name` is the local or flat-file node.
    #[must_use]
    pub fn is_fixed_node(&self, name: &str) -> bool {
        self.settings.fixed_nodes().contains(&name)
    }

    /// The role's prober.
    #[must_use]
    pub fn prober(&self) -> &Arc<ReachabilityProber> {
        &self.prober
    }

    /// Directory used to open nodes.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn DirectoryService> {
        &self.directory
    }

    /// Current state as a storable policy record.
    #[must_use]
    pub fn policy_record(&self) -> PolicyRecord {
        let state = self.read_state();
        PolicyRecord {
            version: POLICY_VERSION,
            policy: state.policy,
            custom_nodes: state.custom_nodes.clone(),
            augmentation: state.augmentation.clone(),
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn session_view(&self) -> SessionView {
        let state = self.read_state();
        SessionView {
            names: state.path.names(),
            generation: state.generation,
            augmentation: state.augmentation.clone(),
        }
    }

    /// Recomputes the path for `policy` and swaps it in.
    ///
    /// Reachability state carries over for nodes present in both paths. Returns whether the
    /// node names changed, and the replaced path, which the caller drops once it no longer
    /// holds the broker lock.
    pub fn apply_policy(&self, policy: SearchPolicy, discovered: &[String]) -> (bool, SearchPath) {
        let mut state = self.write_state();
        let mut path = compute_path(&self.settings, policy, &state.custom_nodes, discovered);
        path.carry_forward(&state.path);
        let changed = !path.same_names(&state.path);
        state.policy = policy;
        state.generation += 1;
        let old = std::mem::replace(&mut state.path, path);
        debug!(
            role = %self.role,
            policy = %policy,
            generation = state.generation,
            changed,
            "search path swapped"
        );
        (changed, old)
    }

    /// Replaces the custom node list. Takes effect on the next [`Self::apply_policy`].
    pub fn set_custom_nodes(&self, nodes: Vec<String>) {
        self.write_state().custom_nodes = nodes;
    }

    /// Replaces the augmentation settings.
    pub fn set_augmentation(&self, augmentation: AugmentConfig) {
        let mut state = self.write_state();
        state.augmentation = augmentation;
        state.generation += 1;
    }

    /// Records a failed open of `name` and makes sure the prober runs.
    pub fn node_open_failed(self: &Arc<Self>, name: &str, err: &Error) {
        let (transitioned, policy) = {
            let mut state = self.write_state();
            (state.path.mark_unreachable(name), state.policy)
        };
        if transitioned {
            warn!(role = %self.role, node = %name, error = %err, "node unreachable");
            self.events.node_reachability_changed(self.role, name, false);
            self.events.search_policy_changed(self.role, policy);
        } else {
            debug!(role = %self.role, node = %name, error = %err, "node still unreachable");
        }
        self.ensure_prober();
    }

    /// Records a successful open of `name`.
    pub fn mark_opened(&self, name: &str) {
        let ((transitioned, first_open), policy) = {
            let mut state = self.write_state();
            (state.path.mark_reachable(name), state.policy)
        };
        if first_open {
            debug!(role = %self.role, node = %name, "node opened for the first time");
            self.events.flush_cache(self.role);
        }
        if transitioned {
            info!(role = %self.role, node = %name, "node reachable again");
            self.events.node_reachability_changed(self.role, name, true);
            self.events.search_policy_changed(self.role, policy);
        }
    }

    /// Starts the prober if any node is unreachable. Returns true if a task was started.
    pub fn ensure_prober(self: &Arc<Self>) -> bool {
        if self.unreachable_count() == 0 {
            return false;
        }
        let target: Arc<dyn ProbeTarget> = Arc::clone(self) as Arc<dyn ProbeTarget>;
        self.prober.ensure_running(&target)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ConfigState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ConfigState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProbeTarget for SearchConfig {
    async fn probe_pass(&self) -> ProbeOutcome {
        let names = self.unreachable_nodes();
        let mut outcome = ProbeOutcome {
            probed: names.len(),
            ..ProbeOutcome::default()
        };

        for name in &names {
            match self.directory.open_node(name).await {
                Ok(mut connection) => {
                    if let Err(err) = connection.close().await {
                        debug!(role = %self.role, node = %name, error = %err, "probe close failed");
                    }
                    self.mark_opened(name);
                    outcome.recovered += 1;
                }
                Err(err) => {
                    debug!(role = %self.role, node = %name, error = %err, "probe open failed");
                }
            }
        }

        outcome.remaining = self.unreachable_count();
        outcome
    }

    fn unreachable_count(&self) -> usize {
        self.read_state().path.unreachable_names().len()
    }
}

fn compute_path(
    settings: &BrokerConfig,
    policy: SearchPolicy,
    custom_nodes: &[String],
    discovered: &[String],
) -> SearchPath {
    let [local, flat_file] = settings.fixed_nodes();
    match policy {
        SearchPolicy::Local => SearchPath::assemble(local, flat_file, std::iter::empty::<&str>()),
        SearchPolicy::Custom => SearchPath::assemble(local, flat_file, custom_nodes),
        SearchPolicy::Automatic if settings.dhcp_ldap_enabled => SearchPath::assemble(
            local,
            flat_file,
            discovered.iter().filter(|name| is_ldap_node(name)),
        ),
        SearchPolicy::Automatic => {
            SearchPath::assemble(local, flat_file, std::iter::empty::<&str>())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BrokerEvent, EventLog};
    use dirsearch_core::memory::MemoryDirectory;
    use dirsearch_core::types::{DEFAULT_FLAT_FILE_NODE, DEFAULT_LOCAL_NODE};
    use std::time::Duration;

    struct Fixture {
        directory: MemoryDirectory,
        events: Arc<EventLog>,
        config: Arc<SearchConfig>,
    }

    fn fixture(settings: BrokerConfig, record: &PolicyRecord, discovered: &[String]) -> Fixture {
        let directory = MemoryDirectory::new();
        for name in [DEFAULT_LOCAL_NODE, DEFAULT_FLAT_FILE_NODE, "/LDAPv3/a", "/LDAPv3/b"] {
            directory.add_node(name, Vec::new()).unwrap();
        }
        let events = Arc::new(EventLog::new());
        let config = SearchConfig::new(
            SearchRole::Authentication,
            Arc::new(settings),
            record,
            discovered,
            Arc::new(directory.clone()),
            Arc::clone(&events) as Arc<dyn BrokerEvents>,
        );
        Fixture {
            directory,
            events,
            config,
        }
    }

    fn custom(nodes: &[&str]) -> PolicyRecord {
        PolicyRecord::new()
            .with_policy(SearchPolicy::Custom)
            .with_custom_nodes(nodes.iter().copied())
    }

    #[test]
    fn paths_per_policy() {
        let discovered = vec!["/LDAPv3/a".to_string(), "/NIS/x".to_string()];
        let fx = fixture(
            BrokerConfig::default().with_dhcp_ldap(true),
            &custom(&["/LDAPv3/b"]),
            &discovered,
        );
        assert_eq!(
            fx.config.node_names(),
            vec![DEFAULT_LOCAL_NODE, DEFAULT_FLAT_FILE_NODE, "/LDAPv3/b"]
        );

        let (changed, _) = fx.config.apply_policy(SearchPolicy::Automatic, &discovered);
        assert!(changed);
        assert_eq!(
            fx.config.node_names(),
            vec![DEFAULT_LOCAL_NODE, DEFAULT_FLAT_FILE_NODE, "/LDAPv3/a"]
        );

        let (changed, old) = fx.config.apply_policy(SearchPolicy::Local, &discovered);
        assert!(changed);
        assert_eq!(old.len(), 3);
        assert_eq!(fx.config.node_names().len(), 2);

        let (changed, _) = fx.config.apply_policy(SearchPolicy::Local, &discovered);
        assert!(!changed);
        assert_eq!(fx.config.generation(), 3);
    }

    #[test]
    fn automatic_without_dhcp_is_local_only() {
        let discovered = vec!["/LDAPv3/a".to_string()];
        let fx = fixture(BrokerConfig::default(), &PolicyRecord::new(), &discovered);
        assert_eq!(fx.config.node_names().len(), 2);
    }

    #[tokio::test]
    async fn open_failure_marks_and_probe_recovers() {
        let settings = BrokerConfig::default().with_probe_backoff(1, 1);
        let fx = fixture(settings, &custom(&["/LDAPv3/a"]), &[]);
        fx.directory.set_available("/LDAPv3/a", false).unwrap();

        fx.config.node_open_failed(
            "/LDAPv3/a",
            &Error::NodeUnavailable("/LDAPv3/a".to_string()),
        );
        assert_eq!(fx.config.unreachable_nodes(), vec!["/LDAPv3/a"]);
        assert!(fx.config.prober().is_active());
        assert!(fx
            .config
            .prober()
            .wait_for_pass(0, Duration::from_secs(5))
            .await);
        assert!(!fx.config.is_reachable("/LDAPv3/a"));

        fx.directory.set_available("/LDAPv3/a", true).unwrap();
        fx.config.prober().network_transition();
        let seen = fx.config.prober().passes_completed();
        assert!(fx
            .config
            .prober()
            .wait_for_pass(seen, Duration::from_secs(5))
            .await);
        for _ in 0..100 {
            if fx.config.unreachable_nodes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.config.is_reachable("/LDAPv3/a"));
        assert_eq!(fx.directory.open_connections("/LDAPv3/a"), 0);

        let events = fx.events.snapshot();
        assert!(events.contains(&BrokerEvent::NodeReachabilityChanged {
            role: SearchRole::Authentication,
            node: "/LDAPv3/a".to_string(),
            reachable: true,
        }));
        assert!(events.contains(&BrokerEvent::FlushCache {
            role: SearchRole::Authentication
        }));
    }

    #[test]
    fn reachability_carries_over_a_switch() {
        let fx = fixture(BrokerConfig::default(), &custom(&["/LDAPv3/a", "/LDAPv3/b"]), &[]);
        fx.config.node_open_failed("/LDAPv3/b", &Error::Timeout("b".to_string()));

        fx.config.set_custom_nodes(vec!["/LDAPv3/b".to_string()]);
        let (changed, _) = fx.config.apply_policy(SearchPolicy::Custom, &[]);
        assert!(changed);
        assert_eq!(fx.config.unreachable_nodes(), vec!["/LDAPv3/b"]);
    }

    #[test]
    fn policy_record_reflects_state() {
        let fx = fixture(BrokerConfig::default(), &custom(&["/LDAPv3/a"]), &[]);
        fx.config
            .set_augmentation(AugmentConfig::new("/LDAPv3/b").with_record_type("Users", ["RealName"]));
        let record = fx.config.policy_record();
        assert_eq!(record.policy, SearchPolicy::Custom);
        assert_eq!(record.custom_nodes, vec!["/LDAPv3/a"]);
        assert!(record.augmentation.enabled);
        assert!(fx.config.is_fixed_node(DEFAULT_FLAT_FILE_NODE));
        assert!(!fx.config.is_fixed_node("/LDAPv3/a"));
    }
}
