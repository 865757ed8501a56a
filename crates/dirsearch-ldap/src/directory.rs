//! LDAP implementation of the backend node protocol.
//!
//! Each configured server is one node. A search runs once per query and its entries are held
//! on the connection under a token; later batches are served from that buffer until it drains.

use crate::client::{LdapConnector, LdapSession, Ldap3Connector, SearchScope};
use crate::config::LdapNodeConfig;
use crate::mapping::{select_mappings, RecordTypeMapping};
use async_trait::async_trait;
use dirsearch_core::error::Error;
use dirsearch_core::node::{
    take_batch, BackendToken, DirectoryService, FetchLimits, NodeConnection, RecordBatch,
};
use dirsearch_core::query::{AttributeQuery, AttributeSelection, RecordQuery};
use dirsearch_core::types::Record;
use dirsearch_core::Result;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

struct LdapNodeHandle {
    config: Arc<LdapNodeConfig>,
    connector: Arc<dyn LdapConnector>,
}

/// Directory service over a set of LDAP servers.
pub struct LdapDirectory {
    nodes: HashMap<String, LdapNodeHandle>,
}

impl LdapDirectory {
    /// Creates a directory that connects with `ldap3`.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration is invalid or two nodes share a name.
    pub fn new(configs: Vec<LdapNodeConfig>) -> Result<Self> {
        let mut directory = Self {
            nodes: HashMap::new(),
        };
        for config in configs {
            let config = Arc::new(config.validated()?);
            let connector: Arc<dyn LdapConnector> =
                Arc::new(Ldap3Connector::new(Arc::clone(&config)));
            directory.insert(config, connector)?;
        }
        Ok(directory)
    }

    #[cfg(test)]
    pub(crate) fn with_connector(
        config: LdapNodeConfig,
        connector: Arc<dyn LdapConnector>,
    ) -> Result<Self> {
        let mut directory = Self {
            nodes: HashMap::new(),
        };
        directory.insert(Arc::new(config), connector)?;
        Ok(directory)
    }

    fn insert(&mut self, config: Arc<LdapNodeConfig>, connector: Arc<dyn LdapConnector>) -> Result<()> {
        let name = config.node_name();
        if self.nodes.contains_key(&name) {
            return Err(Error::ConfigError(format!("duplicate LDAP node `{name}`")));
        }
        self.nodes.insert(name, LdapNodeHandle { config, connector });
        Ok(())
    }

    /// Names of the configured nodes, sorted.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DirectoryService for LdapDirectory {
    async fn open_node(&self, name: &str) -> Result<Box<dyn NodeConnection>> {
        let handle = self
            .nodes
            .get(name)
            .ok_or_else(|| Error::NodeUnavailable(format!("{name}: not configured")))?;

        let session = connect_and_bind(handle)
            .await
            .map_err(|err| Error::NodeUnavailable(format!("{name}: {err}")))?;
        debug!(node = %name, "opened LDAP node");

        Ok(Box::new(LdapNode {
            name: name.to_string(),
            config: Arc::clone(&handle.config),
            session: Some(session),
            buffers: HashMap::new(),
            next_token: 1,
        }))
    }
}

async fn connect_and_bind(handle: &LdapNodeHandle) -> Result<Box<dyn LdapSession>> {
    let mut session = with_timeout(&handle.config, handle.connector.connect()).await?;
    if let Some(credentials) = handle.config.credentials() {
        with_timeout(
            &handle.config,
            session.simple_bind(credentials.bind_dn(), credentials.bind_password()),
        )
        .await?;
    }
    Ok(session)
}

async fn with_timeout<F, T>(config: &LdapNodeConfig, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(config.operation_timeout(), fut)
        .await
        .map_err(|_| Error::Timeout("LDAP operation timed out".to_string()))?
}

/// Open connection to one LDAP node.
struct LdapNode {
    name: String,
    config: Arc<LdapNodeConfig>,
    session: Option<Box<dyn LdapSession>>,
    buffers: HashMap<u64, VecDeque<Record>>,
    next_token: u64,
}

impl LdapNode {
    fn session(&mut self) -> Result<&mut Box<dyn LdapSession>> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::NodeUnavailable(format!("{} is closed", self.name)))
    }

    async fn search_mapping(
        &mut self,
        mapping: &RecordTypeMapping,
        filter: &str,
        selection: &AttributeSelection,
    ) -> Result<Vec<Record>> {
        let config = Arc::clone(&self.config);
        let base = config.search_base(mapping).to_string();
        let attributes = mapping.ldap_attributes(selection);
        debug!(node = %self.name, base = %base, filter = %filter, "LDAP search");

        let session = self.session()?;
        let entries = with_timeout(
            &config,
            session.search(
                &base,
                SearchScope::Subtree,
                filter,
                &attributes,
                config.size_limit(),
            ),
        )
        .await?;

        Ok(entries
            .iter()
            .filter_map(|entry| mapping.entry_to_record(entry, selection))
            .collect())
    }

    fn take_buffer(&mut self, token: BackendToken) -> Result<VecDeque<Record>> {
        self.buffers.remove(&token.value()).ok_or_else(|| {
            Error::InvalidContext(format!("unknown token {token} on {}", self.name))
        })
    }

    fn serve(
        &mut self,
        mut queue: VecDeque<Record>,
        limits: FetchLimits,
        previous: Option<BackendToken>,
    ) -> Result<RecordBatch> {
        let records = match take_batch(&mut queue, limits) {
            Ok(records) => records,
            Err(err) => {
                if let Some(token) = previous {
                    self.buffers.insert(token.value(), queue);
                }
                return Err(err);
            }
        };

        let continuation = if queue.is_empty() {
            None
        } else {
            let token = self.next_token;
            self.next_token += 1;
            self.buffers.insert(token, queue);
            Some(BackendToken::new(token))
        };
        Ok(RecordBatch {
            records,
            continuation,
        })
    }
}

#[async_trait]
impl NodeConnection for LdapNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    async fn list_records(
        &mut self,
        query: &RecordQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch> {
        if let Some(token) = continuation {
            let queue = self.take_buffer(token)?;
            return self.serve(queue, limits, Some(token));
        }

        let config = Arc::clone(&self.config);
        let mappings = select_mappings(config.mappings(), &query.record_types)?;
        let mut queue = VecDeque::new();
        for mapping in mappings {
            let filter = mapping.record_filter(query);
            queue.extend(
                self.search_mapping(mapping, &filter, &query.attributes)
                    .await?,
            );
        }
        self.serve(queue, limits, None)
    }

    async fn search_by_attribute_value(
        &mut self,
        query: &AttributeQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch> {
        if let Some(token) = continuation {
            let queue = self.take_buffer(token)?;
            return self.serve(queue, limits, Some(token));
        }

        let config = Arc::clone(&self.config);
        let mappings = select_mappings(config.mappings(), &query.record_types)?;
        let mut searchable = Vec::new();
        let mut last_error = None;
        for mapping in mappings {
            match mapping.attribute_filter(query) {
                Ok(filter) => searchable.push((mapping, filter)),
                Err(err) => last_error = Some(err),
            }
        }
        if searchable.is_empty() {
            if let Some(err) = last_error {
                return Err(err.into());
            }
        }

        let mut queue = VecDeque::new();
        for (mapping, filter) in searchable {
            queue.extend(
                self.search_mapping(mapping, &filter, &query.attributes)
                    .await?,
            );
        }
        self.serve(queue, limits, None)
    }

    async fn get_attribute_value(
        &mut self,
        record_type: &str,
        record_name: &str,
        attribute: &str,
    ) -> Result<Vec<String>> {
        let config = Arc::clone(&self.config);
        let mapping = config
            .mapping_for(record_type)
            .ok_or_else(|| Error::InvalidRecordType(record_type.to_string()))?;
        if mapping.ldap_attribute(attribute).is_none() {
            return Err(Error::NoMapping(format!("{attribute} for {record_type}")));
        }

        let selection = AttributeSelection::Only(vec![attribute.to_string()]);
        let filter = mapping.name_filter(record_name);
        let records = self.search_mapping(mapping, &filter, &selection).await?;
        records
            .first()
            .and_then(|record| record.values(attribute))
            .map(<[String]>::to_vec)
            .ok_or_else(|| Error::NotFound(format!("{attribute} of {record_type} `{record_name}`")))
    }

    async fn release_continuation(&mut self, token: BackendToken) -> Result<()> {
        self.buffers.remove(&token.value());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.buffers.clear();
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.unbind().await {
                warn!(node = %self.name, error = %err, "LDAP unbind failed");
            }
        }
        Ok(())
    }
}
