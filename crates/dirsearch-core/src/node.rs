//! Backend directory-node protocol.
//!
//! A [`DirectoryService`] opens nodes by name; each open node is a [`NodeConnection`] that
//! serves record lists and attribute-value searches in batches. A batch that does not exhaust
//! the result set carries a [`BackendToken`] which the caller passes back to fetch the next
//! batch, or hands to [`NodeConnection::release_continuation`] to abandon it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::error::{Error, Result};
use crate::query::{AttributeQuery, RecordQuery, SearchRequest};
use crate::types::Record;

/// Node-issued continuation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendToken(u64);

impl BackendToken {
    /// Wraps a raw token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Bounds for a single backend fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    /// Maximum total [`Record::wire_size`] of the batch.
    pub buffer_size: usize,
    /// Maximum number of records in the batch.
    pub max_records: Option<usize>,
}

impl FetchLimits {
    /// Creates limits with no record cap.
    #[must_use]
    pub const fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            max_records: None,
        }
    }

    /// Caps the number of records.
    #[must_use]
    pub const fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }
}

/// One batch of records returned by a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBatch {
    /// Records in node order.
    pub records: Vec<Record>,
    /// Present when the node holds more results for this query.
    pub continuation: Option<BackendToken>,
}

impl RecordBatch {
    /// A batch with no records and nothing further to fetch.
    #[must_use]
    pub fn exhausted() -> Self {
        Self::default()
    }

    /// Returns true if the node reported no more data.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.records.is_empty() && self.continuation.is_none()
    }
}

/// An open backend node.
///
/// The connection is owned by exactly one holder; it is never shared between sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeConnection: Send {
    /// Name of the node this connection was opened on.
    fn node_name(&self) -> &str;

    /// Lists records matching `query`.
    async fn list_records(
        &mut self,
        query: &RecordQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch>;

    /// Lists records whose attribute value matches `query`.
    async fn search_by_attribute_value(
        &mut self,
        query: &AttributeQuery,
        limits: FetchLimits,
        continuation: Option<BackendToken>,
    ) -> Result<RecordBatch>;

    /// Reads the values of one attribute of one record.
    async fn get_attribute_value(
        &mut self,
        record_type: &str,
        record_name: &str,
        attribute: &str,
    ) -> Result<Vec<String>>;

    /// Releases the node-side state behind a continuation token.
    async fn release_continuation(&mut self, token: BackendToken) -> Result<()>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens backend nodes by name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Opens the node called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeUnavailable`] when the node cannot be reached.
    async fn open_node(&self, name: &str) -> Result<Box<dyn NodeConnection>>;
}

/// Runs `request` against `connection`.
///
/// # Errors
///
/// Propagates the node's error unchanged.
pub async fn fetch(
    connection: &mut dyn NodeConnection,
    request: &SearchRequest,
    limits: FetchLimits,
    continuation: Option<BackendToken>,
) -> Result<RecordBatch> {
    match request {
        SearchRequest::Records(query) => {
            connection
                .list_records(query, limits, continuation)
                .await
        }
        SearchRequest::AttributeValue(query) => {
            connection
                .search_by_attribute_value(query, limits, continuation)
                .await
        }
    }
}

/// Pops the longest prefix of `queue` that fits `limits`.
///
/// # Errors
///
/// Returns [`Error::BufferTooSmall`] when the first queued record alone exceeds the buffer;
/// the queue is left untouched in that case.
pub fn take_batch(queue: &mut VecDeque<Record>, limits: FetchLimits) -> Result<Vec<Record>> {
    let max_records = limits.max_records.unwrap_or(usize::MAX);
    let mut used = 0usize;
    let mut batch = Vec::new();

    while batch.len() < max_records {
        let Some(next) = queue.front() else { break };
        let size = next.wire_size();
        if used + size > limits.buffer_size {
            if batch.is_empty() {
                return Err(Error::BufferTooSmall { continuation: None });
            }
            break;
        }
        used += size;
        if let Some(record) = queue.pop_front() {
            batch.push(record);
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record_types;

    fn queue_of(count: usize) -> VecDeque<Record> {
        (0..count)
            .map(|i| Record::new(record_types::USERS, format!("user{i:02}")))
            .collect()
    }

    #[test]
    fn take_batch_respects_max_records() {
        let mut queue = queue_of(5);
        let batch = take_batch(&mut queue, FetchLimits::new(4096).with_max_records(2)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(batch[0].name, "user00");
    }

    #[test]
    fn take_batch_respects_buffer_size() {
        let mut queue = queue_of(5);
        let one = queue[0].wire_size();
        let batch = take_batch(&mut queue, FetchLimits::new(one * 2 + 1)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn take_batch_reports_buffer_too_small_without_consuming() {
        let mut queue = queue_of(1);
        let result = take_batch(&mut queue, FetchLimits::new(4));
        assert!(matches!(result, Err(Error::BufferTooSmall { .. })));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn batch_exhaustion() {
        assert!(RecordBatch::exhausted().is_exhausted());
        let batch = RecordBatch {
            records: Vec::new(),
            continuation: Some(BackendToken::new(7)),
        };
        assert!(!batch.is_exhausted());
    }

    #[tokio::test]
    async fn fetch_dispatches_on_request_kind() {
        let mut connection = MockNodeConnection::new();
        connection
            .expect_list_records()
            .times(1)
            .returning(|_, _, _| Ok(RecordBatch::exhausted()));
        connection
            .expect_search_by_attribute_value()
            .times(1)
            .returning(|_, _, _| {
                Ok(RecordBatch {
                    records: vec![Record::new(record_types::USERS, "jdoe")],
                    continuation: None,
                })
            });

        let records = SearchRequest::Records(RecordQuery::new());
        let batch = fetch(&mut connection, &records, FetchLimits::new(1024), None)
            .await
            .unwrap();
        assert!(batch.is_exhausted());

        let search = SearchRequest::AttributeValue(AttributeQuery::new("RecordName", "jdoe"));
        let batch = fetch(&mut connection, &search, FetchLimits::new(1024), None)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
    }
}
