//! Command batches: the unit of network I/O.
//!
//! A [`CommandBuilder`] encodes sub-commands into drafts of at most
//! `max_per_batch` commands each. Sealing turns the drafts into a
//! [`CommandBatch`] chain linked through `sibling`, which the writer flushes
//! in order and the reader completes one link at a time.
//!
//! Each link owns an `Arc<BatchShared>` holding its completion state and the
//! response bytes collected by the reader. Deferred results keep a clone of
//! that `Arc` and the position of their sub-command within the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::buffer_pool::BufferPool;
use crate::error::{MemcacheError, Result};

/// Default sub-commands per batch before spilling into a sibling.
pub const DEFAULT_MAX_COMMANDS_PER_BATCH: usize = 128;

/// Completion state of one batch. Leaves `Pending` exactly once.
#[derive(Debug, Clone)]
pub(crate) enum BatchState {
    Pending,
    Completed,
    Failed(MemcacheError),
}

/// Location of one record inside [`BatchResponses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordSpan {
    /// Header line bounds within `bytes`.
    pub start: usize,
    pub end: usize,
    /// Index into `payloads` for `VA` records.
    pub payload: Option<usize>,
}

/// Raw response data for one batch, in sub-command order.
#[derive(Debug, Default)]
pub(crate) struct BatchResponses {
    pub bytes: Vec<u8>,
    pub records: Vec<RecordSpan>,
    pub payloads: Vec<Vec<u8>>,
}

impl BatchResponses {
    /// Empty responses for `records` sub-commands, with the header bytes
    /// buffer taken from `pool`.
    pub fn with_capacity(records: usize, pool: &BufferPool) -> Self {
        let mut bytes = pool.acquire(records * 16);
        bytes.clear();
        Self {
            bytes,
            records: Vec::with_capacity(records),
            payloads: Vec::new(),
        }
    }

    /// Header line and optional body of the record at `index`.
    pub fn record(&self, index: usize) -> Result<(&[u8], Option<&[u8]>)> {
        let span = self
            .records
            .get(index)
            .ok_or_else(|| MemcacheError::broken_pipe(format!("no response for sub-command {}", index)))?;
        let line = &self.bytes[span.start..span.end];
        let body = match span.payload {
            Some(i) => Some(
                self.payloads
                    .get(i)
                    .map(Vec::as_slice)
                    .ok_or_else(|| MemcacheError::broken_pipe("missing VA payload"))?,
            ),
            None => None,
        };
        Ok((line, body))
    }

    fn release(self, pool: &BufferPool) {
        pool.release(self.bytes);
        for payload in self.payloads {
            pool.release(payload);
        }
    }
}

#[derive(Debug, Default)]
struct ResponseSlot {
    data: Option<BatchResponses>,
    /// Set by `release`; responses arriving afterwards go straight back to
    /// the pool.
    released: bool,
}

/// Completion gate and response storage shared between a batch and its
/// deferred results.
#[derive(Debug)]
pub(crate) struct BatchShared {
    responses: Mutex<ResponseSlot>,
    state: watch::Sender<BatchState>,
    submitted: AtomicBool,
}

impl BatchShared {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(BatchState::Pending);
        Arc::new(Self {
            responses: Mutex::new(ResponseSlot::default()),
            state,
            submitted: AtomicBool::new(false),
        })
    }

    /// Mark the batch as handed to a connection. Returns false if it already was.
    pub fn mark_submitted(&self) -> bool {
        !self.submitted.swap(true, Ordering::AcqRel)
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Store the responses and release waiters.
    ///
    /// Returns false if the batch had already left `Pending`. Responses that
    /// nobody can read any more, because the batch failed or its pipeline
    /// already finished, are returned to `pool`.
    pub fn complete_ok(&self, responses: BatchResponses, pool: &BufferPool) -> bool {
        if !matches!(*self.state.borrow(), BatchState::Pending) {
            responses.release(pool);
            return false;
        }
        {
            let mut slot = self.lock_responses();
            if slot.released {
                drop(slot);
                responses.release(pool);
            } else {
                slot.data = Some(responses);
            }
        }
        self.transition(BatchState::Completed)
    }

    /// Fail the batch with `err` if it is still pending.
    pub fn fail(&self, err: MemcacheError) -> bool {
        self.transition(BatchState::Failed(err))
    }

    fn transition(&self, next: BatchState) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, BatchState::Pending) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), BatchState::Pending)
    }

    /// Wait until the batch completes or fails.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, BatchState::Pending))
            .await
            .map_err(|_| MemcacheError::ConnectionClosed)?
            .clone();
        match state {
            BatchState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Run `f` over the record at `index` of a completed batch.
    pub fn with_record<T>(
        &self,
        index: usize,
        f: impl FnOnce(&[u8], Option<&[u8]>) -> Result<T>,
    ) -> Result<T> {
        if let BatchState::Failed(err) = &*self.state.borrow() {
            return Err(err.clone());
        }
        let slot = self.lock_responses();
        let responses = slot.data.as_ref().ok_or(MemcacheError::PipelineFinished)?;
        let (line, body) = responses.record(index)?;
        f(line, body)
    }

    /// Return response buffers to `pool`. Later reads see `PipelineFinished`,
    /// including for a batch still in flight.
    pub fn release(&self, pool: &BufferPool) {
        let responses = {
            let mut slot = self.lock_responses();
            slot.released = true;
            slot.data.take()
        };
        if let Some(responses) = responses {
            responses.release(pool);
        }
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, ResponseSlot> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A sealed batch ready for the wire, with its overflow chain.
#[derive(Debug)]
pub(crate) struct CommandBatch {
    pub request: Bytes,
    pub count: usize,
    pub shared: Arc<BatchShared>,
    pub sibling: Option<Box<CommandBatch>>,
}

impl CommandBatch {
    /// Number of links in the chain starting here.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut next = self.sibling.as_deref();
        while let Some(batch) = next {
            len += 1;
            next = batch.sibling.as_deref();
        }
        len
    }

    /// Split the chain into its links, in wire order.
    pub fn into_links(self) -> Vec<CommandBatch> {
        let mut links = Vec::with_capacity(self.chain_len());
        let mut next = Some(Box::new(self));
        while let Some(mut batch) = next {
            next = batch.sibling.take();
            links.push(*batch);
        }
        links
    }

    /// Fail every link in the chain.
    pub fn fail_chain(self, err: &MemcacheError) {
        for link in self.into_links() {
            link.shared.fail(err.clone());
        }
    }
}

struct BatchDraft {
    request: BytesMut,
    count: usize,
    shared: Arc<BatchShared>,
}

impl BatchDraft {
    fn new() -> Self {
        Self {
            request: BytesMut::with_capacity(256),
            count: 0,
            shared: BatchShared::new(),
        }
    }
}

/// Accumulates encoded sub-commands, spilling into a new batch every
/// `max_per_batch` commands.
pub(crate) struct CommandBuilder {
    max_per_batch: usize,
    drafts: Vec<BatchDraft>,
}

impl CommandBuilder {
    pub fn new(max_per_batch: usize) -> Self {
        Self {
            max_per_batch: max_per_batch.max(1),
            drafts: Vec::new(),
        }
    }

    /// Encode one sub-command. Returns the batch it landed in and its index
    /// within that batch.
    pub fn push(&mut self, encode: impl FnOnce(&mut BytesMut)) -> (Arc<BatchShared>, usize) {
        let needs_new = self
            .drafts
            .last()
            .map_or(true, |draft| draft.count >= self.max_per_batch);
        if needs_new {
            self.drafts.push(BatchDraft::new());
        }

        let last = self.drafts.len() - 1;
        let draft = &mut self.drafts[last];
        encode(&mut draft.request);
        let index = draft.count;
        draft.count += 1;
        (draft.shared.clone(), index)
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Sub-commands encoded since the last seal.
    pub fn pending_commands(&self) -> usize {
        self.drafts.iter().map(|d| d.count).sum()
    }

    /// Turn the accumulated drafts into one sibling chain.
    pub fn seal(&mut self) -> Option<CommandBatch> {
        let mut chain: Option<Box<CommandBatch>> = None;
        for draft in self.drafts.drain(..).rev() {
            chain = Some(Box::new(CommandBatch {
                request: draft.request.freeze(),
                count: draft.count,
                shared: draft.shared,
                sibling: chain,
            }));
        }
        chain.map(|head| *head)
    }
}
