//! Progress of a paginated multi-node query.

use dirsearch_core::node::BackendToken;
use dirsearch_core::query::SearchRequest;
use dirsearch_core::types::Record;
use dirsearch_core::Error;
use std::collections::{BTreeMap, VecDeque};

/// Why a call stopped with a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationReason {
    /// Not even one record fit the caller's buffer.
    BufferTooSmall,
    /// The caller's buffer filled up with records still pending.
    BufferFull,
    /// The current node is exhausted and another one follows.
    NextNode,
    /// The path is exhausted; completes without a continuation.
    EndOfList,
    /// The current node holds more results.
    MoreData,
}

/// State of the search state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Fetch a batch from the current node.
    GetRecordList,
    /// Move pending records into the caller's page.
    AddDataToBuffer,
    /// Advance to the next usable node.
    GetNextNode,
    /// End the call, registering progress when needed.
    SetContinuation(ContinuationReason),
    /// The query is complete.
    Done,
    /// The query failed and is discarded.
    Error(Error),
}

/// Resumable progress of one query.
#[derive(Debug)]
pub(crate) struct ContinuationRecord {
    pub node_index: usize,
    pub pending: VecDeque<Record>,
    pub pending_buffer_size: usize,
    pub delivered: usize,
    pub limit: Option<usize>,
    pub backend_token: Option<BackendToken>,
    /// Consecutive empty batches the current node returned with a token.
    pub empty_batches: u32,
    pub state: RunState,
    pub request: SearchRequest,
    pub augment_attributes: BTreeMap<String, Vec<String>>,
    pub generation: u64,
}

impl ContinuationRecord {
    pub fn new(
        request: SearchRequest,
        limit: Option<usize>,
        augment_attributes: BTreeMap<String, Vec<String>>,
        generation: u64,
    ) -> Self {
        Self {
            node_index: 0,
            pending: VecDeque::new(),
            pending_buffer_size: 0,
            delivered: 0,
            limit,
            backend_token: None,
            empty_batches: 0,
            state: RunState::GetRecordList,
            request,
            augment_attributes,
            generation,
        }
    }

    /// Records the caller may still receive, `None` when unlimited.
    pub fn remaining_limit(&self) -> Option<usize> {
        self.limit
            .map(|limit| limit.saturating_sub(self.delivered))
    }

    pub fn limit_reached(&self) -> bool {
        self.remaining_limit() == Some(0)
    }

    /// Returns true if `request` is the same kind of query as the one in progress.
    pub fn accepts(&self, request: &SearchRequest) -> bool {
        matches!(
            (&self.request, request),
            (SearchRequest::Records(_), SearchRequest::Records(_))
                | (SearchRequest::AttributeValue(_), SearchRequest::AttributeValue(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsearch_core::query::{AttributeQuery, RecordQuery};

    #[test]
    fn limit_accounting() {
        let mut record = ContinuationRecord::new(
            SearchRequest::Records(RecordQuery::new()),
            Some(5),
            BTreeMap::new(),
            0,
        );
        assert_eq!(record.remaining_limit(), Some(5));
        record.delivered = 5;
        assert!(record.limit_reached());

        record.limit = None;
        assert_eq!(record.remaining_limit(), None);
        assert!(!record.limit_reached());
    }

    #[test]
    fn accepts_same_kind_only() {
        let record = ContinuationRecord::new(
            SearchRequest::Records(RecordQuery::new()),
            None,
            BTreeMap::new(),
            0,
        );
        assert!(record.accepts(&SearchRequest::Records(
            RecordQuery::new().with_record_name("other")
        )));
        assert!(!record.accepts(&SearchRequest::AttributeValue(AttributeQuery::new(
            "UniqueID", "501"
        ))));
        assert_eq!(record.state, RunState::GetRecordList);
    }
}
