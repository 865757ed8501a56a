//! Configuration structures for the search broker.
//!
//! [`BrokerConfig`] controls where policy blobs and marker files live, which nodes are the
//! fixed local pair at the head of every search path, how the reachability prober backs off,
//! and which network LDAP nodes are known when discovery is static.

use crate::backoff::ProbeBackoff;
use crate::types::{DEFAULT_FLAT_FILE_NODE, DEFAULT_LOCAL_NODE};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Configuration for a broker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_backoff_limits"))]
pub struct BrokerConfig {
    /// Directory holding the `search-<role>.json` policy blobs
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,

    /// Directory holding the active-policy marker files
    #[serde(default = "default_marker_dir")]
    pub marker_dir: PathBuf,

    /// Name of the local node, always first in a search path
    #[validate(custom(function = "validate_node_name"))]
    #[serde(default = "default_local_node_name")]
    pub local_node_name: String,

    /// Name of the local flat-file node, always second in a search path
    #[validate(custom(function = "validate_node_name"))]
    #[serde(default = "default_flat_file_node_name")]
    pub flat_file_node_name: String,

    /// Initial delay between probe passes, in seconds
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_probe_min_backoff_secs")]
    pub probe_min_backoff_secs: u64,

    /// Cap on the delay between probe passes, in seconds
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_probe_max_backoff_secs")]
    pub probe_max_backoff_secs: u64,

    /// All-failed passes before the probe delay doubles
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_probe_passes_per_step")]
    pub probe_passes_per_step: u32,

    /// How long a custom-node update waits for a probe pass, in seconds
    #[validate(range(min = 0, max = 300))]
    #[serde(default = "default_policy_switch_wait_secs")]
    pub policy_switch_wait_secs: u64,

    /// Whether the Automatic policy includes network-discovered LDAP nodes
    #[serde(default)]
    pub dhcp_ldap_enabled: bool,

    /// Statically known network LDAP nodes
    #[validate(custom(function = "validate_node_names"))]
    #[serde(default)]
    pub discovered_nodes: Vec<String>,
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("/var/db/dirsearch")
}

fn default_marker_dir() -> PathBuf {
    PathBuf::from("/var/run/dirsearch")
}

fn default_local_node_name() -> String {
    DEFAULT_LOCAL_NODE.to_string()
}

fn default_flat_file_node_name() -> String {
    DEFAULT_FLAT_FILE_NODE.to_string()
}

const fn default_probe_min_backoff_secs() -> u64 {
    crate::backoff::DEFAULT_PROBE_MIN_BACKOFF_SECS
}

const fn default_probe_max_backoff_secs() -> u64 {
    crate::backoff::DEFAULT_PROBE_MAX_BACKOFF_SECS
}

const fn default_probe_passes_per_step() -> u32 {
    crate::backoff::DEFAULT_PROBE_PASSES_PER_STEP
}

const fn default_policy_switch_wait_secs() -> u64 {
    15
}

fn validate_node_name(name: &str) -> Result<(), ValidationError> {
    if name.starts_with('/') && name.len() > 1 {
        Ok(())
    } else {
        Err(ValidationError::new("node_name"))
    }
}

fn validate_node_names(names: &[String]) -> Result<(), ValidationError> {
    names.iter().try_for_each(|name| validate_node_name(name))
}

fn validate_backoff_limits(config: &BrokerConfig) -> Result<(), ValidationError> {
    if config.probe_max_backoff_secs >= config.probe_min_backoff_secs {
        Ok(())
    } else {
        Err(ValidationError::new("probe_backoff_range"))
    }
}

impl BrokerConfig {
    /// Create a configuration storing its state under the given directories.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn new(policy_dir: impl Into<PathBuf>, marker_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let config = Self {
            policy_dir: policy_dir.into(),
            marker_dir: marker_dir.into(),
            ..Self::default()
        };

        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;

        Ok(config)
    }

    /// Set the local node name.
    #[must_use]
    pub fn with_local_node(mut self, name: impl Into<String>) -> Self {
        self.local_node_name = name.into();
        self
    }

    /// Set the local flat-file node name.
    #[must_use]
    pub fn with_flat_file_node(mut self, name: impl Into<String>) -> Self {
        self.flat_file_node_name = name.into();
        self
    }

    /// Set the probe backoff limits, in seconds.
    #[must_use]
    pub const fn with_probe_backoff(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.probe_min_backoff_secs = min_secs;
        self.probe_max_backoff_secs = max_secs;
        self
    }

    /// Set the number of all-failed passes per backoff doubling.
    #[must_use]
    pub const fn with_probe_passes_per_step(mut self, passes: u32) -> Self {
        self.probe_passes_per_step = passes;
        self
    }

    /// Set the bounded wait after a custom-node update, in seconds.
    #[must_use]
    pub const fn with_policy_switch_wait(mut self, seconds: u64) -> Self {
        self.policy_switch_wait_secs = seconds;
        self
    }

    /// Enable or disable network-discovered LDAP nodes in the Automatic policy.
    #[must_use]
    pub const fn with_dhcp_ldap(mut self, enabled: bool) -> Self {
        self.dhcp_ldap_enabled = enabled;
        self
    }

    /// Set the statically known network LDAP nodes.
    #[must_use]
    pub fn with_discovered_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discovered_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Backoff state for a fresh prober.
    #[must_use]
    pub const fn probe_backoff(&self) -> ProbeBackoff {
        ProbeBackoff::with_limits(
            Duration::from_secs(self.probe_min_backoff_secs),
            Duration::from_secs(self.probe_max_backoff_secs),
            self.probe_passes_per_step,
        )
    }

    /// Get the custom-node update wait as a Duration.
    #[must_use]
    pub const fn policy_switch_wait(&self) -> Duration {
        Duration::from_secs(self.policy_switch_wait_secs)
    }

    /// The fixed nodes at the head of every search path.
    #[must_use]
    pub fn fixed_nodes(&self) -> [&str; 2] {
        [&self.local_node_name, &self.flat_file_node_name]
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            policy_dir: default_policy_dir(),
            marker_dir: default_marker_dir(),
            local_node_name: default_local_node_name(),
            flat_file_node_name: default_flat_file_node_name(),
            probe_min_backoff_secs: default_probe_min_backoff_secs(),
            probe_max_backoff_secs: default_probe_max_backoff_secs(),
            probe_passes_per_step: default_probe_passes_per_step(),
            policy_switch_wait_secs: default_policy_switch_wait_secs(),
            dhcp_ldap_enabled: false,
            discovered_nodes: Vec::new(),
        }
    }
}
