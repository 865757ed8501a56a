//! LDAP connection layer.
//!
//! [`LdapConnector`] and [`LdapSession`] abstract the `ldap3` connection so the node logic can
//! be exercised against mocks.

use crate::config::LdapNodeConfig;
use async_trait::async_trait;
use dirsearch_core::error::Error;
use dirsearch_core::Result;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use native_tls::{Certificate, TlsConnector};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// sizeLimitExceeded still carries the entries returned so far
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;

/// Represents the search scope for LDAP queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// LDAP entry representation used by the client.
#[derive(Debug, Clone)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (values preserved order from server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    /// Returns the first value of the attribute if present.
    ///
    /// Attribute names compare case-insensitively.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all values for the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(attribute)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                    .map(|(_, values)| values)
            })
            .map(Vec::as_slice)
    }
}

/// One bound LDAP connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapSession: Send {
    /// Binds with a DN and password.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Runs a search returning at most `size_limit` entries.
    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
        size_limit: usize,
    ) -> Result<Vec<LdapEntry>>;

    /// Closes the connection.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens LDAP connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// Connects to the server. The returned session is not bound yet.
    async fn connect(&self) -> Result<Box<dyn LdapSession>>;
}

/// Connects to one LDAP node over `ldap3`, with TLS from the node's settings.
pub struct Ldap3Connector {
    config: Arc<LdapNodeConfig>,
}

impl Ldap3Connector {
    /// Creates a connector for the node described by `config`.
    #[must_use]
    pub fn new(config: Arc<LdapNodeConfig>) -> Self {
        Self { config }
    }

    /// TLS connector for the node, `None` when the platform defaults apply.
    fn tls(&self) -> Result<Option<TlsConnector>> {
        let mut builder = TlsConnector::builder();
        if !self.config.tls_verify() {
            builder.danger_accept_invalid_certs(true);
        } else if let Some(path) = self.config.tls_ca_cert() {
            let pem = fs::read(path).map_err(|err| {
                Error::ConfigError(format!("cannot read CA file {}: {err}", path.display()))
            })?;
            let ca = Certificate::from_pem(&pem)
                .map_err(|err| Error::ConfigError(format!("bad CA file {}: {err}", path.display())))?;
            builder.add_root_certificate(ca);
        } else {
            return Ok(None);
        }
        builder
            .build()
            .map(Some)
            .map_err(|err| Error::ConfigError(format!("TLS setup for {}: {err}", self.config.url())))
    }
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(&self) -> Result<Box<dyn LdapSession>> {
        let mut settings = LdapConnSettings::new().set_conn_timeout(self.config.connection_timeout());
        if let Some(tls) = self.tls()? {
            settings = settings
                .set_connector(tls)
                .set_no_tls_verify(!self.config.tls_verify());
        }
        let (conn, ldap) = LdapConnAsync::with_settings(settings, self.config.url())
            .await
            .map_err(ldap_failure)?;
        ldap3::drive!(conn);
        Ok(Box::new(Ldap3Session {
            ldap,
            deadline: self.config.operation_timeout(),
        }))
    }
}

struct Ldap3Session {
    ldap: ldap3::Ldap,
    deadline: Duration,
}

impl Ldap3Session {
    /// Runs one LDAP operation under the per-operation deadline.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = ldap3::result::Result<T>> + Send,
    {
        match timeout(self.deadline, call).await {
            Ok(result) => result.map_err(ldap_failure),
            Err(_) => Err(Error::Timeout(format!(
                "LDAP {operation} exceeded {}ms",
                self.deadline.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl LdapSession for Ldap3Session {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let mut ldap = self.ldap.clone();
        let outcome = self.bounded("bind", ldap.simple_bind(dn, password)).await?;
        outcome.success().map_err(ldap_failure)?;
        Ok(())
    }

    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
        size_limit: usize,
    ) -> Result<Vec<LdapEntry>> {
        let mut ldap = self.ldap.clone();
        ldap.with_search_options(
            SearchOptions::new().sizelimit(i32::try_from(size_limit).unwrap_or(i32::MAX)),
        );
        let result = self
            .bounded(
                "search",
                ldap.search(base_dn, scope.into(), filter, attributes.to_vec()),
            )
            .await?;
        let (entries, outcome) = (result.0, result.1);
        if outcome.rc != RC_SIZE_LIMIT_EXCEEDED {
            outcome.success().map_err(ldap_failure)?;
        }
        Ok(entries
            .into_iter()
            .map(|raw| {
                let entry = SearchEntry::construct(raw);
                LdapEntry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                }
            })
            .collect())
    }

    async fn unbind(&mut self) -> Result<()> {
        let mut ldap = self.ldap.clone();
        self.bounded("unbind", ldap.unbind()).await
    }
}

fn ldap_failure(err: ldap3::LdapError) -> Error {
    Error::ExternalServiceError {
        service: "ldap".to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LdapEntry {
        let mut attributes = HashMap::new();
        attributes.insert("uid".to_string(), vec!["jdoe".to_string()]);
        attributes.insert(
            "memberUid".to_string(),
            vec!["jdoe".to_string(), "asmith".to_string()],
        );
        LdapEntry {
            dn: "uid=jdoe,dc=example,dc=com".to_string(),
            attributes,
        }
    }

    #[test]
    fn entry_lookup_is_case_insensitive() {
        let entry = entry();
        assert_eq!(entry.first("uid"), Some("jdoe"));
        assert_eq!(entry.first("UID"), Some("jdoe"));
        assert_eq!(entry.values("memberuid").map(<[String]>::len), Some(2));
        assert!(entry.first("mail").is_none());
    }

    #[test]
    fn scope_conversion() {
        assert!(matches!(Scope::from(SearchScope::Base), Scope::Base));
        assert!(matches!(Scope::from(SearchScope::OneLevel), Scope::OneLevel));
        assert!(matches!(Scope::from(SearchScope::Subtree), Scope::Subtree));
    }

    fn connector(config: LdapNodeConfig) -> Ldap3Connector {
        Ldap3Connector::new(Arc::new(config))
    }

    #[test]
    fn tls_follows_the_node_settings() {
        let config = || LdapNodeConfig::new("ldaps://ldap.example.com", "dc=example,dc=com").unwrap();
        assert!(connector(config()).tls().unwrap().is_none());
        assert!(connector(config().with_tls_verification(false))
            .tls()
            .unwrap()
            .is_some());
    }

    #[test]
    fn unreadable_ca_file_is_a_config_error() {
        let config = LdapNodeConfig::new("ldaps://ldap.example.com", "dc=example,dc=com")
            .unwrap()
            .with_tls_ca_cert("/nonexistent/ca.pem".into());
        let Err(Error::ConfigError(message)) = connector(config).tls() else {
            panic!("expected a configuration error");
        };
        assert!(message.contains("/nonexistent/ca.pem"), "{message}");
    }
}
