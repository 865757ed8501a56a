//! Persistent per-role search policy.
//!
//! Each role's policy lives in a JSON blob `search-<role>.json`. A missing blob is created with
//! defaults; an unreadable one is moved aside to `search-<role>.json.corrupt` and replaced with
//! defaults, so loading never fails.

use crate::persistence::BlobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirsearch_core::error::Error;
use dirsearch_core::types::{record_type_suffix, SearchPolicy, SearchRole};
use dirsearch_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// Current policy blob format version.
pub const POLICY_VERSION: u32 = 1;

/// Attribute augmentation settings for a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AugmentConfig {
    /// Whether augmentation runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Primary node whose records are augmented; empty means every node.
    #[serde(default)]
    pub source_node: String,
    /// Node queried for companion records.
    #[serde(default)]
    pub target_node: String,
    /// Attributes to augment, keyed by record type.
    #[serde(default)]
    pub record_types: BTreeMap<String, Vec<String>>,
}

impl AugmentConfig {
    /// Creates an enabled configuration augmenting from `target_node`.
    #[must_use]
    pub fn new(target_node: impl Into<String>) -> Self {
        Self {
            enabled: true,
            source_node: String::new(),
            target_node: target_node.into(),
            record_types: BTreeMap::new(),
        }
    }

    /// Restricts augmentation to records from `source_node`.
    #[must_use]
    pub fn with_source_node(mut self, source_node: impl Into<String>) -> Self {
        self.source_node = source_node.into();
        self
    }

    /// Augments `attributes` on records of `record_type`.
    #[must_use]
    pub fn with_record_type<I, S>(mut self, record_type: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record_types.insert(
            record_type.into(),
            attributes.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Returns true if augmentation can run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.target_node.is_empty() && !self.record_types.is_empty()
    }

    /// Attributes configured for `record_type`, matched by full name or by suffix.
    #[must_use]
    pub fn attributes_for(&self, record_type: &str) -> Option<&[String]> {
        self.record_types
            .get(record_type)
            .or_else(|| self.record_types.get(record_type_suffix(record_type)))
            .map(Vec::as_slice)
    }
}

/// Stored policy of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// Blob format version.
    pub version: u32,
    /// Active search policy.
    pub policy: SearchPolicy,
    /// Node names used by the Custom policy.
    #[serde(default)]
    pub custom_nodes: Vec<String>,
    /// Augmentation settings.
    #[serde(default)]
    pub augmentation: AugmentConfig,
    /// Time of the last save.
    pub updated_at: DateTime<Utc>,
}

impl PolicyRecord {
    /// Automatic policy, no custom nodes, augmentation off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: POLICY_VERSION,
            policy: SearchPolicy::default(),
            custom_nodes: Vec::new(),
            augmentation: AugmentConfig::default(),
            updated_at: Utc::now(),
        }
    }

    /// Sets the policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: SearchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the custom node list.
    #[must_use]
    pub fn with_custom_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the augmentation settings.
    #[must_use]
    pub fn with_augmentation(mut self, augmentation: AugmentConfig) -> Self {
        self.augmentation = augmentation;
        self
    }
}

impl Default for PolicyRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a stored policy blob was rejected.
#[derive(Debug, ThisError)]
pub enum PolicyFileError {
    /// The blob is not a valid policy document.
    #[error("unparseable policy blob: {0}")]
    Unparseable(#[from] serde_json::Error),
    /// The blob was written by an incompatible version.
    #[error("policy version {found}, expected {expected}")]
    VersionMismatch {
        /// Version found in the blob
        found: u32,
        /// Version this build writes
        expected: u32,
    },
}

impl From<PolicyFileError> for Error {
    fn from(err: PolicyFileError) -> Self {
        Self::ParseError(err.to_string())
    }
}

/// Reads and writes per-role policy records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Loads the role's policy, recovering with defaults when needed.
    async fn load(&self, role: SearchRole) -> Result<PolicyRecord>;

    /// Saves the role's policy.
    async fn save(&self, role: SearchRole, record: &PolicyRecord) -> Result<()>;

    /// Returns the role's augmentation settings if augmentation is enabled.
    ///
    /// Reads the stored record, so it answers for tools that inspect the saved policy without
    /// a running broker. A running [`Broker`](crate::Broker) serves sessions from the settings
    /// held by its [`SearchConfig`](crate::SearchConfig) instead.
    async fn is_augmented_search_enabled(&self, role: SearchRole) -> Result<Option<AugmentConfig>>;
}

/// Name of the blob holding `role`'s policy.
#[must_use]
pub fn policy_blob_name(role: SearchRole) -> String {
    format!("search-{}.json", role.name())
}

/// [`PolicyStore`] over a [`BlobStore`].
pub struct FilePolicyStore {
    blobs: Arc<dyn BlobStore>,
}

impl FilePolicyStore {
    /// Creates a store writing into `blobs`.
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn decode(data: &[u8]) -> std::result::Result<PolicyRecord, PolicyFileError> {
        let record: PolicyRecord = serde_json::from_slice(data)?;
        if record.version != POLICY_VERSION {
            return Err(PolicyFileError::VersionMismatch {
                found: record.version,
                expected: POLICY_VERSION,
            });
        }
        Ok(record)
    }

    async fn write_default(&self, role: SearchRole, name: &str) -> PolicyRecord {
        let record = PolicyRecord::new();
        match serde_json::to_vec_pretty(&record) {
            Ok(data) => {
                if let Err(err) = self.blobs.write(name, &data).await {
                    warn!(role = %role, error = %err, "failed to write default search policy");
                }
            }
            Err(err) => warn!(role = %role, error = %err, "failed to encode default search policy"),
        }
        record
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn load(&self, role: SearchRole) -> Result<PolicyRecord> {
        let name = policy_blob_name(role);
        let data = match self.blobs.read(&name).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                info!(role = %role, "no stored search policy, writing defaults");
                return Ok(self.write_default(role, &name).await);
            }
            Err(err) => {
                warn!(role = %role, error = %err, "failed to read search policy, using defaults");
                return Ok(PolicyRecord::new());
            }
        };

        match Self::decode(&data) {
            Ok(record) => {
                debug!(role = %role, policy = %record.policy, "loaded search policy");
                Ok(record)
            }
            Err(err) => {
                warn!(role = %role, error = %err, "stored search policy is corrupt, recreating");
                let corrupt = format!("{name}.corrupt");
                if let Err(err) = self.blobs.rename(&name, &corrupt).await {
                    warn!(role = %role, error = %err, "failed to preserve corrupt search policy");
                }
                Ok(self.write_default(role, &name).await)
            }
        }
    }

    async fn save(&self, role: SearchRole, record: &PolicyRecord) -> Result<()> {
        let name = policy_blob_name(role);
        let data = serde_json::to_vec_pretty(record)?;

        if self.blobs.exists(&name).await.unwrap_or(false) {
            if let Err(err) = self.blobs.copy(&name, &format!("{name}.bak")).await {
                warn!(role = %role, error = %err, "failed to back up search policy");
            }
        }

        self.blobs.write(&name, &data).await?;
        debug!(role = %role, policy = %record.policy, "saved search policy");
        Ok(())
    }

    async fn is_augmented_search_enabled(&self, role: SearchRole) -> Result<Option<AugmentConfig>> {
        let record = self.load(role).await?;
        Ok(record
            .augmentation
            .enabled
            .then_some(record.augmentation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBlobStore, MockBlobStore};

    fn store() -> (Arc<MemoryBlobStore>, FilePolicyStore) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = FilePolicyStore::new(Arc::clone(&blobs) as Arc<dyn BlobStore>);
        (blobs, store)
    }

    #[tokio::test]
    async fn missing_blob_writes_defaults() {
        let (blobs, store) = store();
        let record = store.load(SearchRole::Authentication).await.unwrap();

        assert_eq!(record.policy, SearchPolicy::Automatic);
        assert!(record.custom_nodes.is_empty());
        assert!(!record.augmentation.enabled);
        assert!(blobs.get("search-authentication.json").is_some());
    }

    #[tokio::test]
    async fn save_and_reload() {
        let (blobs, store) = store();
        let record = PolicyRecord::new()
            .with_policy(SearchPolicy::Custom)
            .with_custom_nodes(["/LDAPv3/ldap1", "/LDAPv3/ldap2"]);

        store.save(SearchRole::Contacts, &record).await.unwrap();
        let loaded = store.load(SearchRole::Contacts).await.unwrap();
        assert_eq!(loaded, record);

        store
            .save(SearchRole::Contacts, &record.clone().with_policy(SearchPolicy::Local))
            .await
            .unwrap();
        let backup = blobs.get("search-contacts.json.bak").unwrap();
        let backup: PolicyRecord = serde_json::from_slice(&backup).unwrap();
        assert_eq!(backup.policy, SearchPolicy::Custom);
    }

    #[tokio::test]
    async fn corrupt_blob_is_preserved_and_replaced() {
        let (blobs, store) = store();
        blobs
            .write("search-network.json", b"{not json")
            .await
            .unwrap();

        let record = store.load(SearchRole::Network).await.unwrap();
        assert_eq!(record.policy, SearchPolicy::Automatic);
        assert_eq!(
            blobs.get("search-network.json.corrupt"),
            Some(b"{not json".to_vec())
        );
        let rewritten = blobs.get("search-network.json").unwrap();
        assert!(FilePolicyStore::decode(&rewritten).is_ok());
    }

    #[tokio::test]
    async fn version_mismatch_counts_as_corrupt() {
        let (blobs, store) = store();
        let mut record = PolicyRecord::new().with_policy(SearchPolicy::Local);
        record.version = POLICY_VERSION + 1;
        blobs
            .write("search-contacts.json", &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let loaded = store.load(SearchRole::Contacts).await.unwrap();
        assert_eq!(loaded.policy, SearchPolicy::Automatic);
        assert!(blobs.get("search-contacts.json.corrupt").is_some());
    }

    #[tokio::test]
    async fn write_failure_is_returned() {
        let (blobs, store) = store();
        blobs.set_fail_writes(true);
        let result = store.save(SearchRole::Authentication, &PolicyRecord::new()).await;
        assert!(matches!(result, Err(Error::IoError(_))));
    }

    #[tokio::test]
    async fn read_failure_falls_back_to_defaults() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_read()
            .returning(|_| Err(Error::IoError("disk gone".to_string())));
        blobs.expect_write().never();
        let store = FilePolicyStore::new(Arc::new(blobs));

        let record = store.load(SearchRole::Authentication).await.unwrap();
        assert_eq!(record.policy, SearchPolicy::Automatic);
    }

    #[tokio::test]
    async fn augmentation_lookup() {
        let (_, store) = store();
        assert_eq!(
            store
                .is_augmented_search_enabled(SearchRole::Authentication)
                .await
                .unwrap(),
            None
        );

        let augmentation = AugmentConfig::new("/LDAPv3/augment")
            .with_record_type("Users", ["EMailAddress", "RealName"]);
        store
            .save(
                SearchRole::Authentication,
                &PolicyRecord::new().with_augmentation(augmentation.clone()),
            )
            .await
            .unwrap();
        let enabled = store
            .is_augmented_search_enabled(SearchRole::Authentication)
            .await
            .unwrap();
        assert_eq!(enabled, Some(augmentation));
    }

    #[test]
    fn augment_attributes_match_by_suffix() {
        let augmentation =
            AugmentConfig::new("/LDAPv3/augment").with_record_type("Users", ["EMailAddress"]);
        assert!(augmentation.is_active());
        assert_eq!(
            augmentation.attributes_for("Standard:Users"),
            Some(&["EMailAddress".to_string()][..])
        );
        assert!(augmentation.attributes_for("Standard:Groups").is_none());
        assert!(!AugmentConfig::default().is_active());
    }

    #[test]
    fn policy_file_error_converts_to_parse_error() {
        let err: Error = PolicyFileError::VersionMismatch {
            found: 7,
            expected: POLICY_VERSION,
        }
        .into();
        assert!(matches!(err, Error::ParseError(_)));
    }
}
