//! Write limiter bounding sub-commands in flight on one connection.
//!
//! The writer records every sub-command it puts on the socket and the reader
//! records every sub-command whose response it has consumed. The difference
//! is the amount of state the peer still owes us; once it reaches the limit
//! the writer stalls instead of letting in-flight batches pile up in memory.
//!
//! # Usage
//!
//! ```ignore
//! let limiter = WriteLimiter::new(8192);
//!
//! // writer side
//! limiter.allow_more_write(batch_len, true).await;
//! limiter.add_write_count(batch_len);
//!
//! // reader side, once the batch is fully read
//! limiter.add_read_count(batch_len);
//! ```

use std::sync::Mutex;

use tokio::sync::Notify;

/// Default maximum outstanding sub-commands per connection.
pub const DEFAULT_WRITE_LIMIT: u64 = 8192;

#[derive(Debug, Default)]
struct Counts {
    write: u64,
    read: u64,
}

impl Counts {
    #[inline]
    fn allows(&self, n: u64, limit: u64) -> bool {
        // An idle connection accepts one flush of any size.
        self.write == self.read || self.write + n <= self.read + limit
    }
}

/// Flow-control gate between a connection's writer and reader.
#[derive(Debug)]
pub struct WriteLimiter {
    counts: Mutex<Counts>,
    changed: Notify,
    limit: u64,
}

impl WriteLimiter {
    /// Create a limiter allowing up to `limit` outstanding sub-commands.
    pub fn new(limit: u64) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            changed: Notify::new(),
            limit,
        }
    }

    /// Maximum outstanding sub-commands.
    #[inline]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Record `n` sub-commands written to the socket.
    pub fn add_write_count(&self, n: u64) {
        self.lock().write += n;
    }

    /// Record `n` sub-command responses read back.
    pub fn add_read_count(&self, n: u64) {
        self.lock().read += n;
        self.changed.notify_waiters();
    }

    /// Sub-commands written but not yet read back.
    pub fn outstanding(&self) -> u64 {
        let counts = self.lock();
        counts.write - counts.read
    }

    /// Check whether `n` more sub-commands may be written.
    ///
    /// With `blocking == false` this answers immediately. With
    /// `blocking == true` it suspends until enough responses have been read
    /// and then returns `true`.
    pub async fn allow_more_write(&self, n: u64, blocking: bool) -> bool {
        loop {
            let notified = self.changed.notified();
            if self.lock().allows(n, self.limit) {
                return true;
            }
            if !blocking {
                return false;
            }
            notified.await;
        }
    }

    /// Forget everything outstanding.
    ///
    /// Called after a connection failure once every in-flight batch has been
    /// failed, so the counters start balanced on the new socket.
    pub fn reset(&self) {
        {
            let mut counts = self.lock();
            counts.read = counts.write;
        }
        self.changed.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for WriteLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_limiter_creation() {
        let limiter = WriteLimiter::new(100);
        assert_eq!(limiter.limit(), 100);
        assert_eq!(limiter.outstanding(), 0);
    }

    #[test]
    fn test_limiter_default() {
        let limiter = WriteLimiter::default();
        assert_eq!(limiter.limit(), DEFAULT_WRITE_LIMIT);
    }

    #[tokio::test]
    async fn test_allow_within_limit() {
        let limiter = WriteLimiter::new(10);
        assert!(limiter.allow_more_write(10, false).await);
        limiter.add_write_count(4);
        assert!(limiter.allow_more_write(6, false).await);
        assert!(!limiter.allow_more_write(7, false).await);
    }

    #[tokio::test]
    async fn test_idle_connection_accepts_oversized_flush() {
        let limiter = WriteLimiter::new(4);
        assert!(limiter.allow_more_write(100, false).await);
        limiter.add_write_count(100);
        assert!(!limiter.allow_more_write(1, false).await);
        limiter.add_read_count(100);
        assert!(limiter.allow_more_write(1, false).await);
    }

    #[tokio::test]
    async fn test_blocks_until_read_recorded() {
        let limit = 8;
        let limiter = Arc::new(WriteLimiter::new(limit));

        assert!(limiter.allow_more_write(limit, true).await);
        limiter.add_write_count(limit);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let allowed = limiter.allow_more_write(1, true).await;
                limiter.add_write_count(1);
                allowed
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        limiter.add_read_count(1);
        let allowed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert!(allowed);
        assert_eq!(limiter.outstanding(), limit);
    }

    #[tokio::test]
    async fn test_reset_releases_waiters() {
        let limiter = Arc::new(WriteLimiter::new(2));
        limiter.add_write_count(5);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow_more_write(2, true).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        limiter.reset();

        let allowed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(allowed);
        assert_eq!(limiter.outstanding(), 0);
    }
}
