//! Device-visible mappings of packet memory.
//!
//! The engine never creates bus addresses itself; it asks a `DmaMapper` service
//! for a `Mapping` and hands the mapping back when the buffer leaves the ring.

use crate::error::MapError;

/// One contiguous device-visible range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSeg {
    pub addr: u64,
    pub len: u32,
}

/// A live mapping. Not `Clone`: every mapping is unmapped exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    segs: Vec<DmaSeg>,
    token: u64,
}

impl Mapping {
    /// `token` is opaque to the engine; mappers use it to find their state.
    pub fn new(segs: Vec<DmaSeg>, token: u64) -> Self {
        Mapping { segs, token }
    }

    pub fn segs(&self) -> &[DmaSeg] {
        &self.segs
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn first_addr(&self) -> Option<u64> {
        self.segs.first().map(|s| s.addr)
    }
}

/// DMA mapping service consumed by the engine.
pub trait DmaMapper: Send + Sync {
    /// Maps `frags` for device access.
    ///
    /// # Errors
    /// `TooManySegments` when the memory needs more than `max_segs` ranges,
    /// `NoMemory` when mapping resources are exhausted.
    fn map(&self, frags: &[&[u8]], max_segs: usize) -> Result<Mapping, MapError>;

    /// Makes device writes visible to the CPU in `dst`.
    fn sync_for_cpu(&self, _mapping: &Mapping, _dst: &mut [u8]) {}

    fn unmap(&self, mapping: Mapping);
}
