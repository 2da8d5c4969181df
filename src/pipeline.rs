//! Pipeline: the per-use-case façade over one connection.
//!
//! Every call encodes one sub-command into the pipeline's current batch and
//! returns a [`Deferred`] handle. Nothing touches the network until
//! [`Pipeline::execute`] is called or the first handle is resolved, so a
//! burst of calls goes out as one write.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = client.pipeline();
//! let set = pipeline.mset("key01", b"ABCD", MSetOptions::default());
//! let get = pipeline.mget("key01", MGetOptions::default());
//! pipeline.execute();
//!
//! assert_eq!(set.resolve().await?.kind, MSetResponseType::Hd);
//! assert_eq!(&get.resolve().await?.data[..], b"ABCD");
//! pipeline.finish();
//! ```

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;

use crate::batch::{BatchShared, CommandBuilder};
use crate::buffer_pool::BufferPool;
use crate::connection::Connection;
use crate::error::{MemcacheError, Result};
use crate::protocol::{
    encode_flush_all, encode_mdel, encode_mget, encode_mset, encode_version, validate_key,
    DecodeResponse, FlushAllResponse, MDelOptions, MDelResponse, MGetOptions, MGetResponse,
    MSetOptions, MSetResponse, VersionResponse,
};

/// Deferred `mg` result.
pub type MGetResult = Deferred<MGetResponse>;
/// Deferred `ms` result.
pub type MSetResult = Deferred<MSetResponse>;
/// Deferred `md` result.
pub type MDelResult = Deferred<MDelResponse>;
/// Deferred `flush_all` result.
pub type FlushAllResult = Deferred<FlushAllResponse>;
/// Deferred `version` result.
pub type VersionResult = Deferred<VersionResponse>;

/// A batch of sub-commands bound to one connection.
///
/// Cheap to clone; clones share the same builder.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    conn: Arc<Connection>,
    pool: Arc<BufferPool>,
    state: Mutex<PipelineState>,
}

struct PipelineState {
    builder: CommandBuilder,
    submitted: Vec<Arc<BatchShared>>,
    finished: bool,
}

impl Pipeline {
    pub(crate) fn new(conn: Arc<Connection>, pool: Arc<BufferPool>, max_per_batch: usize) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                conn,
                pool,
                state: Mutex::new(PipelineState {
                    builder: CommandBuilder::new(max_per_batch),
                    submitted: Vec::new(),
                    finished: false,
                }),
            }),
        }
    }

    /// Connection this pipeline writes to.
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Queue `mg <key>[ c][ N<n>] v`.
    pub fn mget(&self, key: impl AsRef<[u8]>, opts: MGetOptions) -> MGetResult {
        let key = key.as_ref();
        self.push_keyed(key, |buf| encode_mget(buf, key, &opts))
    }

    /// Queue `ms <key> <len>[ C<cas>][ T<ttl>]` with `data` as the value.
    pub fn mset(&self, key: impl AsRef<[u8]>, data: impl AsRef<[u8]>, opts: MSetOptions) -> MSetResult {
        let key = key.as_ref();
        let data = data.as_ref();
        self.push_keyed(key, |buf| encode_mset(buf, key, data, &opts))
    }

    /// Queue `md <key>[ C<cas>][ I[ T<ttl>]]`.
    pub fn mdel(&self, key: impl AsRef<[u8]>, opts: MDelOptions) -> MDelResult {
        let key = key.as_ref();
        self.push_keyed(key, |buf| encode_mdel(buf, key, &opts))
    }

    /// Queue `flush_all`.
    pub fn flush_all(&self) -> FlushAllResult {
        self.push(encode_flush_all)
    }

    /// Queue `version`.
    pub fn version(&self) -> VersionResult {
        self.push(encode_version)
    }

    /// Seal the queued sub-commands and hand them to the connection.
    ///
    /// Does not wait for any response. A no-op when nothing is queued.
    pub fn execute(&self) {
        self.inner.execute();
    }

    /// Release response buffers back to the pool.
    ///
    /// Sub-commands queued but never executed fail with `PipelineFinished`,
    /// as does resolving any handle whose data was released here.
    pub fn finish(self) {
        let mut state = self.inner.lock();
        state.finished = true;
        if let Some(chain) = state.builder.seal() {
            chain.fail_chain(&MemcacheError::PipelineFinished);
        }
        for shared in state.submitted.drain(..) {
            shared.release(&self.inner.pool);
        }
    }

    fn push_keyed<T>(&self, key: &[u8], encode: impl FnOnce(&mut BytesMut)) -> Deferred<T> {
        match validate_key(key) {
            Ok(()) => self.push(encode),
            Err(e) => Deferred::failed(e),
        }
    }

    fn push<T>(&self, encode: impl FnOnce(&mut BytesMut)) -> Deferred<T> {
        let mut state = self.inner.lock();
        if state.finished {
            return Deferred::failed(MemcacheError::PipelineFinished);
        }
        let (shared, index) = state.builder.push(encode);
        Deferred {
            handle: Ok(PendingRecord {
                shared,
                index,
                pipeline: self.inner.clone(),
            }),
            _marker: PhantomData,
        }
    }
}

impl PipelineInner {
    fn execute(&self) {
        let chain = {
            let mut state = self.lock();
            let Some(chain) = state.builder.seal() else {
                return;
            };
            if state.finished {
                chain.fail_chain(&MemcacheError::PipelineFinished);
                return;
            }
            let mut link = Some(&chain);
            while let Some(batch) = link {
                batch.shared.mark_submitted();
                state.submitted.push(batch.shared.clone());
                link = batch.sibling.as_deref();
            }
            chain
        };
        tracing::debug!(
            "Pipeline publishing {} batches to {}",
            chain.chain_len(),
            self.conn.addr()
        );
        self.conn.publish(chain);
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct PendingRecord {
    shared: Arc<BatchShared>,
    index: usize,
    pipeline: Arc<PipelineInner>,
}

/// Handle to one sub-command's eventual response.
///
/// Single use: [`resolve`](Deferred::resolve) consumes the handle.
#[must_use = "a deferred result does nothing until resolved"]
pub struct Deferred<T> {
    handle: std::result::Result<PendingRecord, MemcacheError>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Deferred<T> {
    fn failed(err: MemcacheError) -> Self {
        Self {
            handle: Err(err),
            _marker: PhantomData,
        }
    }
}

impl<T: DecodeResponse> Deferred<T> {
    /// Wait for the owning batch and decode this sub-command's record.
    ///
    /// Executes the pipeline first if the batch has not been submitted yet.
    pub async fn resolve(self) -> Result<T> {
        let pending = self.handle?;
        if !pending.shared.is_submitted() {
            pending.pipeline.execute();
        }
        pending.shared.wait().await?;
        pending.shared.with_record(pending.index, T::decode)
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.handle {
            Ok(pending) => f
                .debug_struct("Deferred")
                .field("index", &pending.index)
                .field("done", &pending.shared.is_done())
                .finish(),
            Err(e) => f.debug_struct("Deferred").field("error", e).finish(),
        }
    }
}
