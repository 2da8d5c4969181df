//! Single-writer path for one connection.
//!
//! Pipelines publish sealed batch chains through a cloneable [`Sender`]; one
//! write loop per connection drains the queue, coalesces whatever has piled
//! up into a single vectored write, and hands the written batches to the
//! in-flight ring for the reader.
//!
//! # Architecture
//!
//! ```text
//! Pipeline 1 ─┐
//! Pipeline 2 ─┼─► mpsc::UnboundedSender<CommandBatch> ─► write loop ─► socket
//! Pipeline N ─┘                                              │
//!                                                            ▼
//!                                                     InFlightRing ─► reader
//! ```
//!
//! Exactly one flush is in flight per connection at any time: publishers
//! only enqueue, and the loop does not pull new batches until the previous
//! write has completed. Each flush takes the longest prefix of the queue
//! that the [`WriteLimiter`] admits; the rest waits for responses.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::backpressure::WriteLimiter;
use crate::batch::CommandBatch;
use crate::error::{MemcacheError, Result};
use crate::inflight::{InFlight, InFlightRing};
use crate::transport::with_deadline;

/// Maximum queued chains pulled into one flush.
const MAX_DRAIN: usize = 64;

/// Publishing side of a connection's queue.
#[derive(Debug, Clone)]
pub(crate) struct Sender {
    tx: mpsc::UnboundedSender<CommandBatch>,
}

impl Sender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommandBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a batch chain for the write loop.
    ///
    /// If the connection has already shut down the chain is failed with
    /// `ConnectionClosed`.
    pub fn publish(&self, batch: CommandBatch) {
        if let Err(mpsc::error::SendError(batch)) = self.tx.send(batch) {
            batch.fail_chain(&MemcacheError::ConnectionClosed);
        }
    }
}

/// Shared state the write loop needs from its connection.
pub(crate) struct WriteContext<'a> {
    pub limiter: &'a WriteLimiter,
    pub ring: &'a InFlightRing,
    pub write_timeout: Option<Duration>,
}

/// Drain the publish queue onto `writer` until shutdown or a write error.
///
/// Batches pulled from `rx` but not yet handed to the ring stay in `pending`
/// so the caller can fail them if this future errors or is dropped.
pub(crate) async fn write_loop<W>(
    writer: &mut W,
    rx: &mut mpsc::UnboundedReceiver<CommandBatch>,
    pending: &mut VecDeque<CommandBatch>,
    shutdown: &mut watch::Receiver<bool>,
    ctx: &WriteContext<'_>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        if pending.is_empty() {
            let first = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(()),
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => return Ok(()),
                },
            };
            pending.extend(first.into_links());

            let mut drained = 1;
            while drained < MAX_DRAIN {
                match rx.try_recv() {
                    Ok(batch) => pending.extend(batch.into_links()),
                    Err(_) => break,
                }
                drained += 1;
            }
        }

        let first = pending.front().map_or(0, |b| b.count as u64);
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return Ok(()),
            err = ctx.ring.closed() => return Err(err),
            _ = ctx.limiter.allow_more_write(first, true) => {}
        }

        // Admit the longest prefix of `pending` that stays under the limit.
        let mut take = 1;
        let mut commands = first;
        while let Some(next) = pending.get(take) {
            let more = commands + next.count as u64;
            if !ctx.limiter.allow_more_write(more, false).await {
                break;
            }
            commands = more;
            take += 1;
        }
        ctx.limiter.add_write_count(commands);

        tracing::debug!(
            "Flushing {} of {} batches ({} commands)",
            take,
            pending.len(),
            commands
        );
        with_deadline(ctx.write_timeout, "write", write_batches(writer, pending, take)).await?;

        for _ in 0..take {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(()),
                space = ctx.ring.wait_space() => space?,
            }
            if let Some(batch) = pending.pop_front() {
                ctx.ring.push_now(InFlight {
                    shared: batch.shared,
                    count: batch.count,
                })?;
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Write the request bytes of the first `take` batches with scatter/gather
/// I/O, then flush.
async fn write_batches<W>(writer: &mut W, batches: &VecDeque<CommandBatch>, take: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batches.range(..take).map(|b| b.request.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batches.range(..take), total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(MemcacheError::from(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the bytes after the first `skip_bytes`.
fn build_remaining_slices<'a>(
    batches: impl IntoIterator<Item = &'a CommandBatch>,
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::new();
    let mut offset = 0;

    for batch in batches {
        let start = offset;
        let end = offset + batch.request.len();
        if skip_bytes < end && !batch.request.is_empty() {
            let start_in_request = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&batch.request[start_in_request..]));
        }
        offset = end;
    }

    slices
}
