//! Search sessions.
//!
//! A [`SearchSession`] runs paginated queries across a private copy of its role's search path.
//! Every call drives a small state machine over a [`ContinuationRecord`]; when the call ends
//! before the path is exhausted, the record is parked under a fresh [`ContinuationId`] that the
//! caller hands back to resume.
//!
//! The private node list is rebuilt wholesale, under the session lock, the first time a call
//! observes that the role's path was swapped. A call that is in flight during a swap notices
//! the `abandon` flag at its next transition and fails with [`Error::InvalidContext`].

use crate::augment;
use crate::continuation::{ContinuationReason, ContinuationRecord, RunState};
use crate::policy_store::AugmentConfig;
use crate::search_config::SearchConfig;
use dirsearch_core::error::{Error, ErrorKind};
use dirsearch_core::ids::{ContinuationId, SessionId};
use dirsearch_core::node::{fetch, FetchLimits, NodeConnection};
use dirsearch_core::query::{AttributeQuery, RecordQuery, SearchRequest};
use dirsearch_core::types::{Record, SearchRole};
use dirsearch_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Empty batches with a token tolerated from one node before it is treated as exhausted.
const MAX_EMPTY_BATCHES: u32 = 16;

/// Paging parameters of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Capacity of the caller's output buffer, in [`Record::wire_size`] bytes.
    pub buffer_size: usize,
    /// Cap on records over the whole query; only read when starting a query.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Continuation returned by the previous call.
    #[serde(default)]
    pub continuation: Option<ContinuationId>,
}

impl PageRequest {
    /// Starts a new unlimited query.
    #[must_use]
    pub const fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            limit: None,
            continuation: None,
        }
    }

    /// Caps the total number of records. Zero means unlimited.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = if limit == 0 { None } else { Some(limit) };
        self
    }

    /// Resumes a query.
    #[must_use]
    pub const fn with_continuation(mut self, continuation: ContinuationId) -> Self {
        self.continuation = Some(continuation);
        self
    }
}

/// Records returned by one call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchPage {
    /// Records in path order.
    pub records: Vec<Record>,
    /// Present when more results may follow.
    pub continuation: Option<ContinuationId>,
}

impl SearchPage {
    /// Returns true if the query has finished.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.continuation.is_none()
    }
}

struct NodeEntry {
    name: String,
    handle: Option<Box<dyn NodeConnection>>,
}

impl NodeEntry {
    fn new(name: String) -> Self {
        Self { name, handle: None }
    }
}

struct SessionState {
    nodes: Vec<NodeEntry>,
    generation: u64,
    augmentation: AugmentConfig,
    augment_handle: Option<Box<dyn NodeConnection>>,
    augment_unavailable: bool,
    continuations: HashMap<ContinuationId, ContinuationRecord>,
    closed: bool,
}

/// Output buffer of the current call.
struct PageBuffer {
    records: Vec<Record>,
    used: usize,
    capacity: usize,
}

impl PageBuffer {
    const fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            used: 0,
            capacity,
        }
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn fits(&self, record: &Record) -> bool {
        self.used.saturating_add(record.wire_size()) <= self.capacity
    }

    fn push(&mut self, record: Record) {
        self.used += record.wire_size();
        self.records.push(record);
    }
}

/// An open search session.
pub struct SearchSession {
    id: SessionId,
    role: SearchRole,
    caller_uid: u32,
    config: Arc<SearchConfig>,
    list_changed: AtomicBool,
    abandon: AtomicBool,
    inner: Mutex<SessionState>,
}

impl SearchSession {
    /// Opens a session on `config`'s current path.
    #[must_use]
    pub fn new(config: Arc<SearchConfig>, caller_uid: u32) -> Self {
        let view = config.session_view();
        Self {
            id: SessionId::new_v4(),
            role: config.role(),
            caller_uid,
            list_changed: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            inner: Mutex::new(SessionState {
                nodes: view.names.into_iter().map(NodeEntry::new).collect(),
                generation: view.generation,
                augmentation: view.augmentation,
                augment_handle: None,
                augment_unavailable: false,
                continuations: HashMap::new(),
                closed: false,
            }),
            config,
        }
    }

    /// Session handle.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Role searched.
    #[must_use]
    pub const fn role(&self) -> SearchRole {
        self.role
    }

    /// Uid of the caller that opened the session.
    #[must_use]
    pub const fn caller_uid(&self) -> u32 {
        self.caller_uid
    }

    /// Lists records across the search path.
    ///
    /// # Errors
    ///
    /// * [`Error::BufferTooSmall`] carrying a continuation when not one record fits the buffer
    /// * [`Error::InvalidContext`] for an unknown or stale continuation, or when the path was
    ///   switched during the call
    /// * [`Error::InvalidSession`] once the session is closed
    pub async fn get_record_list(&self, query: RecordQuery, page: PageRequest) -> Result<SearchPage> {
        self.run(SearchRequest::Records(query), page).await
    }

    /// Searches records by attribute value across the search path.
    ///
    /// # Errors
    ///
    /// As [`Self::get_record_list`].
    pub async fn search_by_attribute_value(
        &self,
        query: AttributeQuery,
        page: PageRequest,
    ) -> Result<SearchPage> {
        self.run(SearchRequest::AttributeValue(query), page).await
    }

    /// Drops a parked continuation and releases its backend state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContext`] if the continuation is unknown.
    pub async fn release_continuation(&self, id: ContinuationId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(Error::InvalidSession(self.id.to_string()));
        }
        let mut record = state
            .continuations
            .remove(&id)
            .ok_or_else(|| Error::InvalidContext(format!("unknown continuation {id}")))?;
        release_token(&mut state.nodes, &mut record).await;
        Ok(())
    }

    /// Node a parked continuation resumes on.
    pub async fn continuation_node(&self, id: ContinuationId) -> Option<String> {
        let state = self.inner.lock().await;
        let record = state.continuations.get(&id)?;
        state
            .nodes
            .get(record.node_index)
            .map(|entry| entry.name.clone())
    }

    /// Number of parked continuations.
    pub async fn open_continuations(&self) -> usize {
        self.inner.lock().await.continuations.len()
    }

    /// Releases every continuation and closes every node handle.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;
        discard(state).await;
        debug!(session = %self.id, role = %self.role, "search session closed");
    }

    /// Tells the session its role's path was swapped.
    ///
    /// An idle session rebuilds on its next call; a busy one abandons the call in flight.
    pub(crate) fn invalidate(&self) {
        self.list_changed.store(true, Ordering::Release);
        if self.inner.try_lock().is_err() {
            self.abandon.store(true, Ordering::Release);
            debug!(session = %self.id, "search path switched during a call, abandoning it");
        }
    }

    async fn run(&self, request: SearchRequest, page: PageRequest) -> Result<SearchPage> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(Error::InvalidSession(self.id.to_string()));
        }
        self.abandon.store(false, Ordering::Release);
        if self.list_changed.swap(false, Ordering::AcqRel) {
            self.rebuild(state).await;
        }

        let record = match page.continuation {
            Some(id) => resume(state, id, &request).await?,
            None => {
                let plan = augment::plan(&state.augmentation, &request);
                ContinuationRecord::new(request, page.limit, plan, state.generation)
            }
        };
        self.drive(state, record, PageBuffer::new(page.buffer_size))
            .await
    }

    async fn rebuild(&self, state: &mut SessionState) {
        discard(state).await;
        let view = self.config.session_view();
        state.nodes = view.names.into_iter().map(NodeEntry::new).collect();
        state.generation = view.generation;
        state.augmentation = view.augmentation;
        state.augment_unavailable = false;
        debug!(
            session = %self.id,
            role = %self.role,
            generation = state.generation,
            "search session node list rebuilt"
        );
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        mut record: ContinuationRecord,
        mut page: PageBuffer,
    ) -> Result<SearchPage> {
        loop {
            if self.abandon.load(Ordering::Acquire) {
                release_token(&mut state.nodes, &mut record).await;
                return Err(Error::InvalidContext(
                    "search path changed during the call".to_string(),
                ));
            }

            let current = std::mem::replace(&mut record.state, RunState::Done);
            record.state = match current {
                RunState::GetRecordList => self.get_record_list_step(state, &mut record, &page).await,
                RunState::AddDataToBuffer => {
                    self.add_data_step(state, &mut record, &mut page).await
                }
                RunState::GetNextNode => self.next_node_step(state, &mut record, &page).await,
                RunState::SetContinuation(reason) => {
                    return self.park(state, record, reason, page);
                }
                RunState::Done => {
                    release_token(&mut state.nodes, &mut record).await;
                    debug!(
                        session = %self.id,
                        delivered = record.delivered,
                        "{} complete",
                        record.request.label()
                    );
                    return Ok(SearchPage {
                        records: page.records,
                        continuation: None,
                    });
                }
                RunState::Error(err) => {
                    release_token(&mut state.nodes, &mut record).await;
                    return Err(err);
                }
            };
        }
    }

    async fn get_record_list_step(
        &self,
        state: &mut SessionState,
        record: &mut ContinuationRecord,
        page: &PageBuffer,
    ) -> RunState {
        // one backend batch per call once data flows
        if !page.is_empty() {
            return RunState::SetContinuation(ContinuationReason::MoreData);
        }
        if record.limit_reached() {
            return RunState::Done;
        }
        if !record.pending.is_empty() {
            return RunState::AddDataToBuffer;
        }

        let Some(entry) = state.nodes.get_mut(record.node_index) else {
            return RunState::Done;
        };
        if !self.config.is_reachable(&entry.name) {
            release_token(&mut state.nodes, record).await;
            return RunState::GetNextNode;
        }
        if entry.handle.is_none() && !self.open_entry(entry).await {
            record.backend_token = None;
            return RunState::GetNextNode;
        }
        let Some(handle) = entry.handle.as_deref_mut() else {
            return RunState::GetNextNode;
        };

        let mut limits = FetchLimits::new(page.capacity);
        if let Some(remaining) = record.remaining_limit() {
            limits = limits.with_max_records(remaining);
        }
        let token = record.backend_token.take();

        match fetch(&mut *handle, &record.request, limits, token).await {
            Ok(batch) => {
                record.backend_token = batch.continuation;
                if batch.is_exhausted() {
                    return RunState::GetNextNode;
                }
                if batch.records.is_empty() {
                    record.empty_batches += 1;
                    if record.empty_batches <= MAX_EMPTY_BATCHES {
                        return RunState::GetRecordList;
                    }
                    warn!(
                        session = %self.id,
                        node = %entry.name,
                        batches = record.empty_batches,
                        "node keeps returning empty batches, moving on"
                    );
                    release_on(&mut *handle, record).await;
                    return RunState::GetNextNode;
                }
                record.empty_batches = 0;
                record.pending = batch.records.into();
                record.pending_buffer_size = page.capacity;
                RunState::AddDataToBuffer
            }
            Err(Error::BufferTooSmall { .. }) => {
                record.backend_token = token;
                RunState::SetContinuation(ContinuationReason::BufferTooSmall)
            }
            Err(err) if err.kind() == ErrorKind::Fatal => RunState::Error(err),
            Err(err) => {
                if err.should_log() {
                    warn!(session = %self.id, node = %entry.name, error = %err, "node query failed");
                } else {
                    debug!(session = %self.id, node = %entry.name, error = %err, "node query failed");
                }
                if let Some(token) = token {
                    if let Err(err) = handle.release_continuation(token).await {
                        debug!(node = %entry.name, error = %err, "failed to release token");
                    }
                }
                RunState::GetNextNode
            }
        }
    }

    async fn add_data_step(
        &self,
        state: &mut SessionState,
        record: &mut ContinuationRecord,
        page: &mut PageBuffer,
    ) -> RunState {
        let source = state
            .nodes
            .get(record.node_index)
            .map(|entry| entry.name.clone())
            .unwrap_or_default();
        let augmenting = !record.augment_attributes.is_empty()
            && augment::applies_to(&state.augmentation, &source);
        if record.pending_buffer_size != page.capacity {
            debug!(
                session = %self.id,
                fetched_with = record.pending_buffer_size,
                buffer = page.capacity,
                "draining records fetched with a different buffer size"
            );
        }

        while let Some(mut next) = record.pending.pop_front() {
            if record.limit_reached() {
                record.pending.push_front(next);
                break;
            }
            if augmenting {
                if let Some(wanted) = augment::planned_for(&record.augment_attributes, &next.record_type) {
                    if let Some(companion) = self.augment_handle(state).await {
                        augment::augment_record(companion, &mut next, wanted).await;
                    }
                }
            }
            if !page.fits(&next) {
                record.pending.push_front(next);
                break;
            }
            page.push(next);
            record.delivered += 1;
        }

        if record.limit_reached() {
            RunState::Done
        } else if !record.pending.is_empty() {
            if page.is_empty() {
                RunState::SetContinuation(ContinuationReason::BufferTooSmall)
            } else {
                RunState::SetContinuation(ContinuationReason::BufferFull)
            }
        } else if record.backend_token.is_some() {
            RunState::GetRecordList
        } else {
            RunState::GetNextNode
        }
    }

    async fn next_node_step(
        &self,
        state: &mut SessionState,
        record: &mut ContinuationRecord,
        page: &PageBuffer,
    ) -> RunState {
        record.empty_batches = 0;
        loop {
            record.node_index += 1;
            let Some(entry) = state.nodes.get_mut(record.node_index) else {
                return if page.is_empty() {
                    RunState::Done
                } else {
                    RunState::SetContinuation(ContinuationReason::EndOfList)
                };
            };
            if !self.config.is_reachable(&entry.name) {
                debug!(session = %self.id, node = %entry.name, "skipping unreachable node");
                continue;
            }
            if entry.handle.is_none() && !self.open_entry(entry).await {
                continue;
            }
            return if page.is_empty() {
                RunState::GetRecordList
            } else {
                RunState::SetContinuation(ContinuationReason::NextNode)
            };
        }
    }

    fn park(
        &self,
        state: &mut SessionState,
        mut record: ContinuationRecord,
        reason: ContinuationReason,
        page: PageBuffer,
    ) -> Result<SearchPage> {
        if reason == ContinuationReason::EndOfList {
            return Ok(SearchPage {
                records: page.records,
                continuation: None,
            });
        }

        record.state = RunState::GetRecordList;
        let id = ContinuationId::new_v4();
        debug!(
            session = %self.id,
            continuation = %id,
            node_index = record.node_index,
            delivered = record.delivered,
            ?reason,
            "parking {}",
            record.request.label()
        );
        state.continuations.insert(id, record);

        if reason == ContinuationReason::BufferTooSmall && page.is_empty() {
            return Err(Error::BufferTooSmall {
                continuation: Some(id),
            });
        }
        Ok(SearchPage {
            records: page.records,
            continuation: Some(id),
        })
    }

    async fn open_entry(&self, entry: &mut NodeEntry) -> bool {
        match self.config.directory().open_node(&entry.name).await {
            Ok(handle) => {
                self.config.mark_opened(&entry.name);
                entry.handle = Some(handle);
                true
            }
            Err(err) => {
                if self.config.is_fixed_node(&entry.name) {
                    debug!(session = %self.id, node = %entry.name, error = %err, "local node failed to open, skipping");
                } else {
                    self.config.node_open_failed(&entry.name, &err);
                }
                false
            }
        }
    }

    async fn augment_handle<'a>(
        &self,
        state: &'a mut SessionState,
    ) -> Option<&'a mut (dyn NodeConnection + 'static)> {
        if state.augment_handle.is_none() {
            if state.augment_unavailable {
                return None;
            }
            let target = state.augmentation.target_node.clone();
            match self.config.directory().open_node(&target).await {
                Ok(handle) => state.augment_handle = Some(handle),
                Err(err) => {
                    debug!(session = %self.id, node = %target, error = %err, "augmenting node unavailable");
                    state.augment_unavailable = true;
                    return None;
                }
            }
        }
        state.augment_handle.as_deref_mut()
    }
}

async fn resume(
    state: &mut SessionState,
    id: ContinuationId,
    request: &SearchRequest,
) -> Result<ContinuationRecord> {
    let mut record = state
        .continuations
        .remove(&id)
        .ok_or_else(|| Error::InvalidContext(format!("unknown continuation {id}")))?;
    if !record.accepts(request) {
        state.continuations.insert(id, record);
        return Err(Error::InvalidRequest(format!(
            "continuation {id} belongs to a different kind of query"
        )));
    }
    if record.generation != state.generation {
        release_token(&mut state.nodes, &mut record).await;
        return Err(Error::InvalidContext(format!("continuation {id} is stale")));
    }
    Ok(record)
}

async fn release_on(handle: &mut dyn NodeConnection, record: &mut ContinuationRecord) {
    if let Some(token) = record.backend_token.take() {
        if let Err(err) = handle.release_continuation(token).await {
            debug!(node = handle.node_name(), error = %err, "failed to release token");
        }
    }
}

async fn release_token(nodes: &mut [NodeEntry], record: &mut ContinuationRecord) {
    if record.backend_token.is_none() {
        return;
    }
    match nodes
        .get_mut(record.node_index)
        .and_then(|entry| entry.handle.as_deref_mut())
    {
        Some(handle) => release_on(handle, record).await,
        None => record.backend_token = None,
    }
}

/// Releases every parked continuation and closes every handle.
async fn discard(state: &mut SessionState) {
    let parked: Vec<ContinuationRecord> = state.continuations.drain().map(|(_, record)| record).collect();
    for mut record in parked {
        release_token(&mut state.nodes, &mut record).await;
    }
    for entry in &mut state.nodes {
        if let Some(mut handle) = entry.handle.take() {
            if let Err(err) = handle.close().await {
                debug!(node = %entry.name, error = %err, "failed to close node");
            }
        }
    }
    if let Some(mut handle) = state.augment_handle.take() {
        if let Err(err) = handle.close().await {
            debug!(node = handle.node_name(), error = %err, "failed to close augmenting node");
        }
    }
}
