//! Bounded correlation ring of batches written but not yet read back.
//!
//! The writer pushes a batch after its request bytes hit the socket; the
//! reader pops batches in the same order and attributes incoming records to
//! them. The ring has a fixed power-of-two capacity and is indexed through a
//! bitmask.
//!
//! Closing the ring fails every queued batch with the closing error and wakes
//! both sides. Sealing it lets the reader drain what is left and then stop.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::batch::BatchShared;
use crate::error::{MemcacheError, Result};

/// Default number of ring slots.
pub const DEFAULT_IN_FLIGHT_CAPACITY: usize = 1024;

/// One batch awaiting its responses.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub shared: Arc<BatchShared>,
    pub count: usize,
}

struct RingState {
    slots: Box<[Option<InFlight>]>,
    mask: usize,
    head: usize,
    tail: usize,
    closed: Option<MemcacheError>,
    sealed: bool,
}

impl RingState {
    #[inline]
    fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len() == self.slots.len()
    }
}

pub(crate) struct InFlightRing {
    state: Mutex<RingState>,
    changed: Notify,
}

impl InFlightRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                mask: capacity - 1,
                head: 0,
                tail: 0,
                closed: None,
                sealed: false,
            }),
            changed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Wait until at least one slot is free.
    pub async fn wait_space(&self) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            {
                let state = self.lock();
                if let Some(err) = &state.closed {
                    return Err(err.clone());
                }
                if !state.is_full() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Append a batch without waiting.
    ///
    /// Callers reserve room with [`wait_space`](Self::wait_space) first. On a
    /// closed or full ring the batch is failed and the error returned.
    pub fn push_now(&self, item: InFlight) -> Result<()> {
        let err = {
            let mut state = self.lock();
            if let Some(err) = state.closed.clone() {
                err
            } else if state.is_full() {
                MemcacheError::broken_pipe("in-flight ring overflow")
            } else {
                let slot = state.tail & state.mask;
                state.slots[slot] = Some(item);
                state.tail += 1;
                drop(state);
                self.changed.notify_waiters();
                return Ok(());
            }
        };
        item.shared.fail(err.clone());
        Err(err)
    }

    /// Take the oldest batch, waiting for one to arrive.
    ///
    /// Returns `Ok(None)` once the ring is sealed and drained.
    pub async fn pop(&self) -> Result<Option<InFlight>> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.lock();
                if let Some(err) = &state.closed {
                    return Err(err.clone());
                }
                if state.len() > 0 {
                    let slot = state.head & state.mask;
                    let item = state.slots[slot].take();
                    state.head += 1;
                    drop(state);
                    self.changed.notify_waiters();
                    if let Some(item) = item {
                        return Ok(Some(item));
                    }
                    continue;
                }
                if state.sealed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Fail every queued batch with `err` and refuse further traffic.
    ///
    /// Only the first close is recorded.
    pub fn close(&self, err: MemcacheError) {
        let drained = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(err.clone());
            let mut drained = Vec::with_capacity(state.len());
            while state.head < state.tail {
                let slot = state.head & state.mask;
                if let Some(item) = state.slots[slot].take() {
                    drained.push(item);
                }
                state.head += 1;
            }
            drained
        };
        for item in drained {
            item.shared.fail(err.clone());
        }
        self.changed.notify_waiters();
    }

    /// No more pushes will come; the reader stops after draining.
    pub fn seal(&self) {
        self.lock().sealed = true;
        self.changed.notify_waiters();
    }

    /// Resolve once the ring has been closed, yielding the closing error.
    pub async fn closed(&self) -> MemcacheError {
        loop {
            let notified = self.changed.notified();
            if let Some(err) = &self.lock().closed {
                return err.clone();
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(count: usize) -> InFlight {
        InFlight {
            shared: BatchShared::new(),
            count,
        }
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(InFlightRing::new(5).capacity(), 8);
        assert_eq!(InFlightRing::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order_across_wrap() {
        let ring = InFlightRing::new(4);
        for round in 0..3 {
            for i in 0..4 {
                ring.wait_space().await.unwrap();
                ring.push_now(item(round * 10 + i)).unwrap();
            }
            for i in 0..4 {
                let got = ring.pop().await.unwrap().unwrap();
                assert_eq!(got.count, round * 10 + i);
            }
        }
        assert_eq!(ring.len(), 0);
    }

    #[tokio::test]
    async fn test_wait_space_blocks_when_full() {
        let ring = Arc::new(InFlightRing::new(2));
        ring.push_now(item(1)).unwrap();
        ring.push_now(item(2)).unwrap();

        let waiter = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.wait_space().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ring.pop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let ring = Arc::new(InFlightRing::new(4));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        ring.push_now(item(7)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.count, 7);
    }

    #[tokio::test]
    async fn test_close_fails_queued_batches() {
        let ring = InFlightRing::new(4);
        let a = item(1);
        let b = item(2);
        let (sa, sb) = (a.shared.clone(), b.shared.clone());
        ring.push_now(a).unwrap();
        ring.push_now(b).unwrap();

        ring.close(MemcacheError::ConnectionClosed);
        assert!(matches!(sa.wait().await, Err(MemcacheError::ConnectionClosed)));
        assert!(matches!(sb.wait().await, Err(MemcacheError::ConnectionClosed)));

        assert!(ring.pop().await.is_err());
        assert!(ring.wait_space().await.is_err());
        let late = item(3);
        let sl = late.shared.clone();
        assert!(ring.push_now(late).is_err());
        assert!(sl.is_done());
        assert!(matches!(ring.closed().await, MemcacheError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_seal_drains_then_stops() {
        let ring = InFlightRing::new(4);
        ring.push_now(item(1)).unwrap();
        ring.seal();
        assert_eq!(ring.pop().await.unwrap().unwrap().count, 1);
        assert!(ring.pop().await.unwrap().is_none());
    }
}
