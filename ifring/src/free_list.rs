//! # Receive Free List
//!
//! ## Purpose
//!
//! Keeps empty receive buffers posted to the device. `credits` counts buffers
//! the device currently owns; the consumer index follows the device as it
//! fills them.
//!
//! ## How it works
//!
//! `refill` allocates, maps and binds buffers at the producer index and tells
//! the device about them in batches (`rxd_refill`), then publishes the last
//! posted index once (`rxd_flush`). It never posts more than
//! `size - credits - 1` buffers: one slot always stays empty so the device's
//! producer index can tell a full list from an empty one. Allocation or mapping
//! failure stops the refill early; whatever was prepared is still posted and
//! the next receive cycle retries.

use crate::Services;
use crate::buf::Buffer;
use crate::dma::{DmaMapper, Mapping};
use crate::error::RefillError;
use crate::ring::RingIndex;
use crate::slot::SlotTable;

/// Counters of one free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeListStats {
    pub id: u8,
    pub credits: u32,
    pub size: u32,
    pub refills: u64,
    /// Refills posting more than 8 buffers.
    pub refills_large: u64,
    pub allocs: u64,
    pub alloc_failures: u64,
    pub map_failures: u64,
    /// `rxd_refill` calls.
    pub notifies: u64,
}

/// Outcome of a refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refilled {
    pub posted: u32,
    pub error: Option<RefillError>,
}

pub struct FreeList {
    qid: u16,
    id: u8,
    ring: RingIndex,
    buf_size: usize,
    batch: usize,
    sds: SlotTable<Buffer>,
    bus_addrs: Vec<u64>,
    stats: FreeListStats,
}

impl FreeList {
    pub fn new(qid: u16, id: u8, size: u32, buf_size: usize, batch: usize) -> Self {
        FreeList {
            qid,
            id,
            ring: RingIndex::new(size),
            buf_size,
            batch,
            sds: SlotTable::create(size as usize),
            bus_addrs: Vec::with_capacity(batch),
            stats: FreeListStats {
                id,
                size,
                ..FreeListStats::default()
            },
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Buffers owned by the device.
    pub fn credits(&self) -> u32 {
        self.ring.in_use()
    }

    pub fn size(&self) -> u32 {
        self.ring.size()
    }

    pub fn cidx(&self) -> u32 {
        self.ring.cidx()
    }

    pub fn pidx(&self) -> u32 {
        self.ring.pidx()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Posts up to `count` fresh buffers.
    pub(crate) fn refill(&mut self, svc: &Services<'_>, count: u32) -> Refilled {
        let reclaimable = self.ring.size() - self.credits() - 1;
        let n = count.min(reclaimable);
        let mut out = Refilled {
            posted: 0,
            error: None,
        };
        if n == 0 {
            return out;
        }
        self.stats.refills += 1;
        if n > 8 {
            self.stats.refills_large += 1;
        }

        self.bus_addrs.clear();
        let mut start = self.ring.pidx();
        for _ in 0..n {
            let Some(buf) = svc.pool.alloc(self.buf_size) else {
                self.stats.alloc_failures += 1;
                out.error = Some(RefillError::OutOfMemory);
                break;
            };
            let mapping = match svc.mapper.map(&[buf.as_slice()], 1) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("rxq {} fl {}: buffer mapping failed: {e}", self.qid, self.id);
                    self.stats.map_failures += 1;
                    out.error = Some(RefillError::MappingFailed);
                    break;
                }
            };
            let Some(addr) = mapping.first_addr() else {
                svc.mapper.unmap(mapping);
                self.stats.map_failures += 1;
                out.error = Some(RefillError::MappingFailed);
                break;
            };
            let pidx = self.ring.pidx();
            if let Err(e) = self.sds.bind(pidx as usize, buf, mapping) {
                panic!("rxq {} fl {}: {e}", self.qid, self.id);
            }
            self.bus_addrs.push(addr);
            self.ring.produce(1);
            self.stats.allocs += 1;
            out.posted += 1;

            if self.bus_addrs.len() == self.batch {
                self.post(svc, start);
                start = self.ring.pidx();
            }
        }
        if !self.bus_addrs.is_empty() {
            self.post(svc, start);
        }
        if out.posted > 0 {
            let size = self.ring.size();
            let last = (self.ring.pidx() + size - 1) % size;
            svc.dev.rxd_flush(self.qid, self.id, last);
        }
        out
    }

    fn post(&mut self, svc: &Services<'_>, start: u32) {
        svc.dev.rxd_refill(self.qid, self.id, start, &self.bus_addrs);
        self.stats.notifies += 1;
        self.bus_addrs.clear();
    }

    /// Refills toward the low-water target `max`, bounded by free slots.
    pub(crate) fn refill_lt(&mut self, svc: &Services<'_>, max: u32) -> Refilled {
        let reclaimable = self.ring.size() - self.credits() - 1;
        self.refill(svc, reclaimable.min(max))
    }

    /// Takes the buffer the device filled at `idx`, which must be the
    /// consumer index.
    ///
    /// # Panics
    /// If `idx` is out of order or the slot is empty.
    pub(crate) fn take(&mut self, idx: u32) -> (Buffer, Mapping) {
        assert_eq!(
            idx,
            self.ring.cidx(),
            "rxq {} fl {}: fragment out of order",
            self.qid,
            self.id
        );
        let Some(entry) = self.sds.release(idx as usize) else {
            panic!("rxq {} fl {}: slot {idx} consumed while empty", self.qid, self.id);
        };
        self.ring.consume(1);
        entry
    }

    /// Releases every posted buffer and resets the indices.
    pub(crate) fn bufs_free(&mut self, mapper: &dyn DmaMapper) -> usize {
        let released = self.sds.destroy(mapper);
        self.ring.reset();
        self.bus_addrs.clear();
        released
    }

    pub fn stats(&self) -> FreeListStats {
        FreeListStats {
            credits: self.credits(),
            ..self.stats
        }
    }

    pub(crate) fn reset_stats(&mut self) {
        self.stats = FreeListStats {
            id: self.id,
            size: self.ring.size(),
            ..FreeListStats::default()
        };
    }
}
