//! In-process directory backend.
//!
//! [`MemoryDirectory`] holds named nodes with their records in memory. It serves the local and
//! flat-file nodes of an embedded broker and doubles as a controllable backend in tests: nodes
//! can be taken offline, batch sizes capped, and open/close/release activity inspected.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::node::{take_batch, BackendToken, DirectoryService, FetchLimits, NodeConnection, RecordBatch};
use crate::query::{AttributeQuery, AttributeSelection, RecordQuery};
use crate::types::Record;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryNodeState {
    records: Vec<Record>,
    available: bool,
    batch_size: Option<usize>,
    opens: usize,
    open_connections: usize,
    released_tokens: usize,
}

impl MemoryNodeState {
    fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            available: true,
            batch_size: None,
            opens: 0,
            open_connections: 0,
            released_tokens: 0,
        }
    }
}

type NodeTable = Arc<RwLock<HashMap<String, MemoryNodeState>>>;

/// Directory whose nodes live in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    nodes: NodeTable,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a node holding `records`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InternalError`] if the node table lock is poisoned.
    pub fn add_node(&self, name: impl Into<String>, records: Vec<Record>) -> Result<()> {
        self.write()?
            .insert(name.into(), MemoryNodeState::new(records));
        Ok(())
    }

    /// Appends records to an existing node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub fn insert_records(&self, name: &str, records: Vec<Record>) -> Result<()> {
        self.with_node(name, |node| node.records.extend(records))
    }

    /// Takes a node online or offline. Offline nodes refuse to open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub fn set_available(&self, name: &str, available: bool) -> Result<()> {
        self.with_node(name, |node| node.available = available)
    }

    /// Caps how many records the node returns per batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub fn set_batch_size(&self, name: &str, batch_size: Option<usize>) -> Result<()> {
        self.with_node(name, |node| node.batch_size = batch_size)
    }

    /// Number of successful opens of the node so far.
    #[must_use]
    pub fn open_count(&self, name: &str) -> usize {
        self.read_node(name, |node| node.opens)
    }

    /// Number of connections to the node that have not been closed.
    #[must_use]
    pub fn open_connections(&self, name: &str) -> usize {
        self.read_node(name, |node| node.open_connections)
    }

    /// Number of continuation tokens released on the node.
    #[must_use]
    pub fn released_tokens(&self, name: &str) -> usize {
        self.read_node(name, |node| node.released_tokens)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, MemoryNodeState>>> {
        self.nodes
            .read()
            .map_err(|_| Error::InternalError("memory directory lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, MemoryNodeState>>> {
        self.nodes
            .write()
            .map_err(|_| Error::InternalError("memory directory lock poisoned".to_string()))
    }

    fn with_node<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MemoryNodeState),
    {
        let mut nodes = self.write()?;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("memory node `{name}`")))?;
        f(node);
        Ok(())
    }

    fn read_node<F>(&self, name: &str, f: F) -> usize
    where
        F: FnOnce(&MemoryNodeState) -> usize,
    {
        self.read()
            .ok()
            .and_then(|nodes| nodes.get(name).map(f))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn open_node(&self, name: &str) -> Result<Box<dyn NodeConnection>> {
        let mut nodes = self.write()?;
        let node = nodes
            .get_mut(name)
            .filter(|node| node.available)
            .ok_or_else(|| {
                debug!(node = %name, "memory node missing or offline");
                Error::NodeUnavailable(name.to_string())
            })?;
        node.opens += 1;
        node.open_connections += 1;
        debug!(node = %name, connections = node.open_connections, "memory node opened");

        Ok(Box::new(MemoryNode {
            name: name.to_string(),
            nodes: Arc::clone(&self.nodes),
            cursors: HashMap::new(),
            next_token: 1,
            closed: false,
        }))
    }
}

/// Open connection to a [`MemoryDirectory`] node.
struct MemoryNode {
    name: String,
    nodes: NodeTable,
    // token -> offset of the next record to return
    cursors: HashMap<u64, usize>,
    next_token: u64,
    closed: bool,
}

impl MemoryNode {
    fn snapshot<P>(&self, predicate: P) -> Result<(Vec<Record>, Option<usize>)>
    where
        P: Fn(&Record) -> bool,
    {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| Error::InternalError("memory directory lock poisoned".to_string()))?;
        let node = nodes
            .get(&self.name)
            .filter(|node| node.available)
            .ok_or_else(|| Error::NodeUnavailable(self.name.clone()))?;
        let matching = node
            .records
            .iter()
            .filter(|record| predicate(record))
            .cloned()
            .collect();
        Ok((matching, node.batch_size))
    }

    fn serve<P>(
        &mut self,
        predicate: P,
        selection: &AttributeSelection,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch>
    where
        P: Fn(&Record) -> bool,
    {
        if self.closed {
            return Err(Error::NodeUnavailable(format!("{} is closed", self.name)));
        }

        let offset = match continuation {
            Some(token) => self.cursors.remove(&token.value()).ok_or_else(|| {
                Error::InvalidContext(format!("unknown token {token} on {}", self.name))
            })?,
            None => 0,
        };

        let (matching, batch_size) = self.snapshot(predicate)?;
        let mut limits = limits;
        if let Some(cap) = batch_size {
            limits.max_records = Some(limits.max_records.map_or(cap, |max| max.min(cap)));
        }

        let mut queue: VecDeque<Record> = matching.iter().skip(offset).cloned().collect();
        let records = match take_batch(&mut queue, limits) {
            Ok(records) => records,
            Err(err) => {
                if let Some(token) = continuation {
                    self.cursors.insert(token.value(), offset);
                }
                return Err(err);
            }
        };

        let next_offset = offset + records.len();
        let continuation = if next_offset < matching.len() && !records.is_empty() {
            let token = self.next_token;
            self.next_token += 1;
            self.cursors.insert(token, next_offset);
            Some(BackendToken::new(token))
        } else {
            None
        };

        let records = records
            .into_iter()
            .map(|mut record| {
                selection.apply(&mut record);
                record
            })
            .collect();

        Ok(RecordBatch {
            records,
            continuation,
        })
    }
}

#[async_trait]
impl NodeConnection for MemoryNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    async fn list_records(
        &mut self,
        query: &RecordQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch> {
        let selection = query.attributes.clone();
        self.serve(|record| query.matches(record), &selection, limits, continuation)
    }

    async fn search_by_attribute_value(
        &mut self,
        query: &AttributeQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch> {
        let selection = query.attributes.clone();
        self.serve(|record| query.matches(record), &selection, limits, continuation)
    }

    async fn get_attribute_value(
        &mut self,
        record_type: &str,
        record_name: &str,
        attribute: &str,
    ) -> Result<Vec<String>> {
        let (matching, _) = self.snapshot(|record| {
            record.record_type.eq_ignore_ascii_case(record_type)
                && record.name.eq_ignore_ascii_case(record_name)
        })?;
        matching
            .first()
            .and_then(|record| record.values(attribute))
            .map(<[String]>::to_vec)
            .ok_or_else(|| {
                Error::NotFound(format!("{attribute} of {record_type} `{record_name}`"))
            })
    }

    async fn release_continuation(&mut self, token: BackendToken) -> Result<()> {
        if self.cursors.remove(&token.value()).is_some() {
            let mut nodes = self
                .nodes
                .write()
                .map_err(|_| Error::InternalError("memory directory lock poisoned".to_string()))?;
            if let Some(node) = nodes.get_mut(&self.name) {
                node.released_tokens += 1;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursors.clear();
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| Error::InternalError("memory directory lock poisoned".to_string()))?;
        if let Some(node) = nodes.get_mut(&self.name) {
            node.open_connections = node.open_connections.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{attributes, record_types};

    fn users(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::new(record_types::USERS, format!("user{i:02}"))
                    .with_attribute(attributes::UNIQUE_ID, [format!("{}", 500 + i)])
            })
            .collect()
    }

    #[tokio::test]
    async fn open_unknown_or_offline_node_fails() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(1)).unwrap();
        directory.set_available("/Local/Default", false).unwrap();

        assert!(matches!(
            directory.open_node("/Local/Default").await,
            Err(Error::NodeUnavailable(_))
        ));
        assert!(matches!(
            directory.open_node("/Nowhere").await,
            Err(Error::NodeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn paginates_with_tokens() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(5)).unwrap();
        directory.set_batch_size("/Local/Default", Some(2)).unwrap();

        let mut node = directory.open_node("/Local/Default").await.unwrap();
        let query = RecordQuery::new();
        let limits = FetchLimits::new(4096);

        let first = node.list_records(&query, limits, None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let token = first.continuation.unwrap();

        let second = node.list_records(&query, limits, Some(token)).await.unwrap();
        assert_eq!(second.records[0].name, "user02");

        let third = node
            .list_records(&query, limits, second.continuation)
            .await
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert!(third.continuation.is_none());
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(3)).unwrap();
        let mut node = directory.open_node("/Local/Default").await.unwrap();

        let result = node
            .list_records(&RecordQuery::new(), FetchLimits::new(4096), Some(BackendToken::new(99)))
            .await;
        assert!(matches!(result, Err(Error::InvalidContext(_))));
    }

    #[tokio::test]
    async fn buffer_too_small_keeps_cursor() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(3)).unwrap();
        directory.set_batch_size("/Local/Default", Some(1)).unwrap();
        let mut node = directory.open_node("/Local/Default").await.unwrap();
        let query = RecordQuery::new();

        let first = node
            .list_records(&query, FetchLimits::new(4096), None)
            .await
            .unwrap();
        let token = first.continuation.unwrap();

        let tiny = node.list_records(&query, FetchLimits::new(8), Some(token)).await;
        assert!(matches!(tiny, Err(Error::BufferTooSmall { .. })));

        let retry = node
            .list_records(&query, FetchLimits::new(4096), Some(token))
            .await
            .unwrap();
        assert_eq!(retry.records[0].name, "user01");
    }

    #[tokio::test]
    async fn release_and_close_are_tracked() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(4)).unwrap();
        directory.set_batch_size("/Local/Default", Some(1)).unwrap();

        let mut node = directory.open_node("/Local/Default").await.unwrap();
        assert_eq!(directory.open_connections("/Local/Default"), 1);

        let batch = node
            .list_records(&RecordQuery::new(), FetchLimits::new(4096), None)
            .await
            .unwrap();
        node.release_continuation(batch.continuation.unwrap())
            .await
            .unwrap();
        node.close().await.unwrap();

        assert_eq!(directory.released_tokens("/Local/Default"), 1);
        assert_eq!(directory.open_connections("/Local/Default"), 0);
        assert_eq!(directory.open_count("/Local/Default"), 1);
    }

    #[tokio::test]
    async fn attribute_search_and_lookup() {
        let directory = MemoryDirectory::new();
        directory.add_node("/Local/Default", users(3)).unwrap();
        let mut node = directory.open_node("/Local/Default").await.unwrap();

        let batch = node
            .search_by_attribute_value(
                &AttributeQuery::new(attributes::UNIQUE_ID, "501"),
                FetchLimits::new(4096),
                None,
            )
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].name, "user01");

        let values = node
            .get_attribute_value(record_types::USERS, "user02", attributes::UNIQUE_ID)
            .await
            .unwrap();
        assert_eq!(values, vec!["502".to_string()]);
    }
}
