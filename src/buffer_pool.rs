//! Size-classed pool of reusable byte buffers.
//!
//! Response payloads are copied out of the framer into buffers taken from
//! this pool and handed back when a pipeline finishes, so steady-state
//! traffic stops allocating once every class has warmed up.
//!
//! # Design
//!
//! - Classes are powers of two starting at [`BASE_CLASS_SIZE`] (64 bytes),
//!   [`NUM_CLASSES`] levels in total.
//! - Each class has its own lock; classes never share state.
//! - Requests above the largest class bypass the pool entirely.
//! - Only buffers whose capacity is exactly a class size are taken back, so a
//!   pooled buffer can never be smaller than its class.
//!
//! # Usage
//!
//! ```
//! use metapipe::BufferPool;
//!
//! let pool = BufferPool::new();
//! let buf = pool.acquire(65);
//! assert_eq!(buf.len(), 65);
//! assert_eq!(buf.capacity(), 128);
//! pool.release(buf);
//! ```

use std::sync::Mutex;

/// Smallest class size in bytes.
pub const BASE_CLASS_SIZE: usize = 64;

/// Number of size classes.
pub const NUM_CLASSES: usize = 12;

/// Largest pooled capacity (128 KiB).
pub const MAX_CLASS_SIZE: usize = BASE_CLASS_SIZE << (NUM_CLASSES - 1);

/// Upper bound on idle buffers kept per class.
const MAX_RETAINED_PER_CLASS: usize = 256;

/// A pool of reusable byte buffers grouped by power-of-two capacity.
///
/// Thread-safe; share it behind an `Arc`.
#[derive(Debug)]
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; NUM_CLASSES],
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Take a buffer of exactly `size` bytes.
    ///
    /// The backing capacity is the smallest class that fits `size`. Sizes
    /// above [`MAX_CLASS_SIZE`] get a plain allocation.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        let Some(level) = class_index(size) else {
            return vec![0u8; size];
        };

        let reused = {
            let mut free = self.classes[level]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        let mut buf = reused.unwrap_or_else(|| Vec::with_capacity(class_size(level)));
        buf.resize(size, 0);
        buf
    }

    /// Return a buffer to its class.
    ///
    /// Buffers whose capacity is not exactly a class size are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        if !is_class_size(capacity) {
            return;
        }
        let Some(level) = class_index(capacity) else {
            return;
        };

        buf.clear();
        let mut free = self.classes[level]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_RETAINED_PER_CLASS {
            free.push(buf);
        }
    }

    /// Number of idle buffers held for the class that would serve `size`.
    pub fn idle_count(&self, size: usize) -> usize {
        class_index(size)
            .map(|level| {
                self.classes[level]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .len()
            })
            .unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the smallest class that holds `size` bytes.
#[inline]
fn class_index(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    if size <= BASE_CLASS_SIZE {
        return Some(0);
    }
    let rounded = size.next_power_of_two();
    Some((rounded.trailing_zeros() - BASE_CLASS_SIZE.trailing_zeros()) as usize)
}

#[inline]
fn class_size(level: usize) -> usize {
    BASE_CLASS_SIZE << level
}

#[inline]
fn is_class_size(capacity: usize) -> bool {
    (BASE_CLASS_SIZE..=MAX_CLASS_SIZE).contains(&capacity) && capacity.is_power_of_two()
}
