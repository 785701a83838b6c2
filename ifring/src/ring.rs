//! # Descriptor Ring Index Algebra
//!
//! ## Purpose
//!
//! Every ring in the engine (TX descriptor rings, RX free lists, completion
//! queues) is a fixed-size circular index space with one producer index and one
//! consumer index. This module holds the index math they all share, so the TX
//! and RX sides cannot drift apart in their off-by-one handling.
//!
//! ## How it works
//!
//! When the producer and consumer indices coincide the ring is either empty or
//! full. A wrap flag disambiguates the two: the producer sets it when its index
//! wraps past the end of the ring, the consumer clears it when its own index
//! wraps. The producer can never lap the consumer, so the flag is exactly "the
//! producer is one lap ahead".
//!
//! ## Main components
//!
//! - `get_inuse()`: slots in use for a `(size, cidx, pidx, wrapped)` tuple.
//! - `idx_diff()`: forward distance between two indices with wraparound.
//! - `RingIndex`: the tuple itself with producer/consumer advance operations.

/// Returns the number of slots in use.
///
/// # Arguments
/// * `size` - Number of slots in the ring.
/// * `cidx` - Consumer index, `< size`.
/// * `pidx` - Producer index, `< size`.
/// * `wrapped` - `true` when the producer is one lap ahead of the consumer.
///
/// # Returns
/// A value in `[0, size]`.
#[inline]
pub fn get_inuse(size: u32, cidx: u32, pidx: u32, wrapped: bool) -> u32 {
    debug_assert!(cidx < size && pidx < size, "index out of range");
    if pidx > cidx {
        pidx - cidx
    } else if pidx < cidx {
        size - cidx + pidx
    } else if wrapped {
        size
    } else {
        0
    }
}

/// Forward distance from `tail` to `head` on a ring of `wrap` slots.
#[inline]
pub fn idx_diff(head: u32, tail: u32, wrap: u32) -> u32 {
    if head >= tail {
        head - tail
    } else {
        wrap - tail + head
    }
}

/// Advances `idx` by `n` slots, `n <= size`.
#[inline]
pub fn increment_idx(idx: u32, n: u32, size: u32) -> u32 {
    debug_assert!(n <= size);
    let next = idx + n;
    if next >= size { next - size } else { next }
}

/// Producer/consumer state of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    size: u32,
    cidx: u32,
    pidx: u32,
    wrapped: bool,
}

impl RingIndex {
    /// Creates an empty ring index space of `size` slots.
    ///
    /// # Panics
    /// If `size` is zero.
    pub fn new(size: u32) -> Self {
        assert!(size > 0, "ring size must be positive");
        RingIndex {
            size,
            cidx: 0,
            pidx: 0,
            wrapped: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn cidx(&self) -> u32 {
        self.cidx
    }

    pub fn pidx(&self) -> u32 {
        self.pidx
    }

    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn in_use(&self) -> u32 {
        get_inuse(self.size, self.cidx, self.pidx, self.wrapped)
    }

    pub fn avail(&self) -> u32 {
        self.size - self.in_use()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use() == 0
    }

    pub fn is_full(&self) -> bool {
        self.in_use() == self.size
    }

    /// Moves the producer index forward by `n` slots.
    ///
    /// # Panics
    /// If `n` exceeds the available slots.
    pub fn produce(&mut self, n: u32) {
        assert!(
            n <= self.avail(),
            "producer overrun: {n} > {} available",
            self.avail()
        );
        let next = self.pidx + n;
        if next >= self.size {
            self.pidx = next - self.size;
            self.wrapped = true;
        } else {
            self.pidx = next;
        }
    }

    /// Moves the producer index to `new_pidx`, as reported by a device that
    /// just wrote descriptors starting at the current producer index.
    ///
    /// # Returns
    /// The number of slots consumed by the device.
    ///
    /// # Panics
    /// If the distance is zero or exceeds the available slots.
    pub fn produce_to(&mut self, new_pidx: u32) -> u32 {
        assert!(new_pidx < self.size, "producer index {new_pidx} out of range");
        let n = idx_diff(new_pidx, self.pidx, self.size);
        assert!(n > 0, "device consumed no descriptors");
        self.produce(n);
        n
    }

    /// Moves the consumer index forward by `n` slots.
    ///
    /// # Panics
    /// If `n` exceeds the slots in use.
    pub fn consume(&mut self, n: u32) {
        assert!(
            n <= self.in_use(),
            "consumer overrun: {n} > {} in use",
            self.in_use()
        );
        let next = self.cidx + n;
        if next >= self.size {
            self.cidx = next - self.size;
            self.wrapped = false;
        } else {
            self.cidx = next;
        }
    }

    pub fn reset(&mut self) {
        self.cidx = 0;
        self.pidx = 0;
        self.wrapped = false;
    }
}
