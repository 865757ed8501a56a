//! Configuration types for LDAP nodes.

use crate::mapping::RecordTypeMapping;
use dirsearch_core::error::Error;
use dirsearch_core::types::LDAP_NODE_PREFIX;
use dirsearch_core::Result;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Default connection timeout (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default operation timeout (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;
/// Default cap on entries returned by one search.
pub const DEFAULT_SIZE_LIMIT: usize = 1000;

/// Bind credentials for an LDAP node.
#[derive(Debug, Deserialize)]
pub struct LdapCredentials {
    bind_dn: String,
    bind_password: SecretString,
}

impl LdapCredentials {
    /// Creates credentials for a simple bind.
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, bind_password: impl Into<String>) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            bind_password: SecretString::from(bind_password.into()),
        }
    }

    /// Returns the bind DN.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Returns the bind password.
    #[must_use]
    pub fn bind_password(&self) -> &str {
        self.bind_password.expose_secret()
    }
}

/// Configuration for one LDAP node.
#[derive(Debug, Deserialize, Validate)]
pub struct LdapNodeConfig {
    #[serde(default)]
    node_name: Option<String>,
    #[validate(url)]
    url: String,
    #[serde(default)]
    credentials: Option<LdapCredentials>,
    base_dn: String,
    #[serde(default = "default_tls_verify")]
    tls_verify: bool,
    #[serde(default)]
    tls_ca_cert: Option<PathBuf>,
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connection_timeout_secs")]
    connection_timeout_secs: u64,
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_operation_timeout_secs")]
    operation_timeout_secs: u64,
    #[validate(range(min = 1, max = 100_000))]
    #[serde(default = "default_size_limit")]
    size_limit: usize,
    #[serde(default = "RecordTypeMapping::defaults")]
    mappings: Vec<RecordTypeMapping>,
}

const fn default_tls_verify() -> bool {
    true
}

const fn default_connection_timeout_secs() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

const fn default_size_limit() -> usize {
    DEFAULT_SIZE_LIMIT
}

impl LdapNodeConfig {
    /// Creates a new LDAP node configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the provided URL is invalid or not an `ldap`/`ldaps` URL.
    pub fn new(url: impl Into<String>, base_dn: impl Into<String>) -> Result<Self> {
        Self {
            node_name: None,
            url: url.into(),
            credentials: None,
            base_dn: base_dn.into(),
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            size_limit: DEFAULT_SIZE_LIMIT,
            mappings: RecordTypeMapping::defaults(),
        }
        .validated()
    }

    /// Checks a configuration, e.g. one deserialized from a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] if a field is out of range, or
    /// [`Error::InvalidEndpoint`] if the URL is not an LDAP URL with a host.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ldap" | "ldaps") {
            return Err(Error::InvalidEndpoint(format!(
                "unsupported LDAP scheme `{}`",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidEndpoint(format!("no host in `{}`", self.url)));
        }
        if let Some(name) = &self.node_name {
            if !name.starts_with(LDAP_NODE_PREFIX) {
                return Err(Error::ConfigError(format!(
                    "LDAP node name `{name}` must start with {LDAP_NODE_PREFIX}"
                )));
            }
        }
        Ok(self)
    }

    /// Returns the node name, `/LDAPv3/<host>` unless overridden.
    #[must_use]
    pub fn node_name(&self) -> String {
        if let Some(name) = &self.node_name {
            return name.clone();
        }
        let host = Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.url.clone());
        format!("{LDAP_NODE_PREFIX}{host}")
    }

    /// Returns the LDAP endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the bind credentials, if any.
    #[must_use]
    pub const fn credentials(&self) -> Option<&LdapCredentials> {
        self.credentials.as_ref()
    }

    /// Returns the base distinguished name.
    #[must_use]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Returns the search base for a mapping.
    #[must_use]
    pub fn search_base<'a>(&'a self, mapping: &'a RecordTypeMapping) -> &'a str {
        mapping.search_base.as_deref().unwrap_or(&self.base_dn)
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Returns the operation timeout duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns the per-search entry cap.
    #[must_use]
    pub const fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional custom CA certificate path.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&PathBuf> {
        self.tls_ca_cert.as_ref()
    }

    /// Record-type mappings served by the node.
    #[must_use]
    pub fn mappings(&self) -> &[RecordTypeMapping] {
        &self.mappings
    }

    /// Returns the mapping for a record type.
    #[must_use]
    pub fn mapping_for(&self, record_type: &str) -> Option<&RecordTypeMapping> {
        self.mappings
            .iter()
            .find(|mapping| mapping.record_type.eq_ignore_ascii_case(record_type))
    }

    /// Overrides the node name.
    #[must_use]
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Sets the bind credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: LdapCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replaces the record-type mappings.
    #[must_use]
    pub fn with_mappings(mut self, mappings: Vec<RecordTypeMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verification(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Sets the custom CA certificate path for TLS verification.
    #[must_use]
    pub fn with_tls_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Overrides the connection timeout in seconds.
    #[must_use]
    pub const fn with_connection_timeout_secs(mut self, seconds: u64) -> Self {
        self.connection_timeout_secs = seconds;
        self
    }

    /// Overrides the operation timeout in seconds.
    #[must_use]
    pub const fn with_operation_timeout_secs(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Overrides the per-search entry cap.
    #[must_use]
    pub const fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsearch_core::types::record_types;

    #[test]
    fn builder_overrides() {
        let config = LdapNodeConfig::new("ldaps://ldap.example.com", "dc=example,dc=com")
            .unwrap()
            .with_credentials(LdapCredentials::new("cn=admin,dc=example,dc=com", "secret"))
            .with_connection_timeout_secs(20)
            .with_operation_timeout_secs(30)
            .with_size_limit(50)
            .with_tls_verification(false);

        assert_eq!(config.node_name(), "/LDAPv3/ldap.example.com");
        assert_eq!(config.connection_timeout(), Duration::from_secs(20));
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.size_limit(), 50);
        assert!(!config.tls_verify());
        assert_eq!(config.base_dn(), "dc=example,dc=com");

        let credentials = config.credentials().unwrap();
        assert_eq!(credentials.bind_dn(), "cn=admin,dc=example,dc=com");
        assert_eq!(credentials.bind_password(), "secret");
    }

    #[test]
    fn credentials_are_redacted_in_debug() {
        let credentials = LdapCredentials::new("cn=admin", "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn rejects_non_ldap_urls() {
        assert!(matches!(
            LdapNodeConfig::new("https://ldap.example.com", "dc=example,dc=com"),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(LdapNodeConfig::new("not a url", "dc=example,dc=com").is_err());
    }

    #[test]
    fn node_name_override_must_be_ldap() {
        let config = LdapNodeConfig::new("ldap://10.0.0.5", "dc=example,dc=com")
            .unwrap()
            .with_node_name("/Local/Default");
        assert!(matches!(config.validated(), Err(Error::ConfigError(_))));

        let config = LdapNodeConfig::new("ldap://10.0.0.5", "dc=example,dc=com")
            .unwrap()
            .with_node_name("/LDAPv3/corp");
        assert_eq!(config.validated().unwrap().node_name(), "/LDAPv3/corp");
    }

    #[test]
    fn default_mappings_and_search_base() {
        let config = LdapNodeConfig::new("ldap://ldap.example.com", "dc=example,dc=com").unwrap();
        let users = config.mapping_for(record_types::USERS).unwrap();
        assert_eq!(config.search_base(users), "dc=example,dc=com");
        assert!(config.mapping_for("Standard:Printers").is_none());

        let config = config.with_mappings(vec![RecordTypeMapping::users()
            .with_search_base("ou=people,dc=example,dc=com")]);
        let users = config.mapping_for(record_types::USERS).unwrap();
        assert_eq!(config.search_base(users), "ou=people,dc=example,dc=com");
        assert!(config.mapping_for(record_types::GROUPS).is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: LdapNodeConfig = serde_json::from_str(
            r#"{
                "url": "ldap://ldap.example.com:389",
                "base_dn": "dc=example,dc=com",
                "credentials": {"bind_dn": "cn=reader", "bind_password": "pw"}
            }"#,
        )
        .unwrap();
        let config = config.validated().unwrap();

        assert_eq!(config.node_name(), "/LDAPv3/ldap.example.com");
        assert_eq!(config.size_limit(), DEFAULT_SIZE_LIMIT);
        assert_eq!(config.mappings().len(), 3);
        assert_eq!(config.credentials().unwrap().bind_password(), "pw");
    }
}
