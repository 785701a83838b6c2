//! # Receive Queue
//!
//! ## Purpose
//!
//! Turns completed receive descriptors into packets and hands them upstream.
//!
//! ## How it works
//!
//! `rxeof` asks the device how many packets are complete. For each one, within
//! the budget, `rxd_pkt_get` describes its fragments (free list id and slot);
//! the fragments are taken out of their free lists in order, synced, unmapped
//! and chained, with head padding stripped from the first fragment only. After
//! the batch every free list is topped up, then the packets are delivered in
//! arrival order, optionally through the coalescer. The return value says
//! whether more completions are waiting, so the caller can reschedule instead
//! of looping.
//!
//! ## Main components
//!
//! - `RxQueue`: free lists, optional completion-queue index, coalescer.
//! - `RxQueueStats`: counters snapshot.

use crate::Services;
use crate::buf::{Packet, PacketMeta, Segment};
use crate::config::RX_REFILL_SLACK;
use crate::device::RxdInfo;
use crate::dma::DmaMapper;
use crate::free_list::{FreeList, FreeListStats};
use crate::lro::{Lro, LroStats};
use crate::ring::increment_idx;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxQueueStats {
    pub id: u16,
    pub packets: u64,
    pub bytes: u64,
    /// Polls that found nothing to do.
    pub unavail: u64,
    pub pkt_get_errors: u64,
    /// Batches cut short because the interface stopped.
    pub inactive: u64,
    /// Completion-queue entries without fragments.
    pub cq_only: u64,
    pub lro: LroStats,
    pub free_lists: Vec<FreeListStats>,
}

pub struct RxQueue {
    id: u16,
    fls: Vec<FreeList>,
    /// Consumer index of a separate completion queue.
    cq_cidx: Option<u32>,
    cq_size: u32,
    lro: Option<Lro>,
    ri: RxdInfo,
    stats: RxQueueStats,
}

impl RxQueue {
    pub(crate) fn new(id: u16, fls: Vec<FreeList>, cq_size: Option<u32>, lro: Option<Lro>) -> Self {
        assert!(!fls.is_empty(), "receive queue without free lists");
        RxQueue {
            id,
            fls,
            cq_cidx: cq_size.map(|_| 0),
            cq_size: cq_size.unwrap_or(0),
            lro,
            ri: RxdInfo::default(),
            stats: RxQueueStats {
                id,
                ..RxQueueStats::default()
            },
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn free_lists(&self) -> &[FreeList] {
        &self.fls
    }

    /// Consumer index the device's completion source is read at.
    pub fn cidx(&self) -> u32 {
        self.cq_cidx.unwrap_or_else(|| self.fls[0].cidx())
    }

    /// Posts the initial buffers of every free list.
    ///
    /// # Returns
    /// `false` if a list came up short.
    pub(crate) fn setup(&mut self, svc: &Services<'_>, initial: u32) -> bool {
        let mut complete = true;
        for fl in &mut self.fls {
            fl.bufs_free(svc.mapper);
            let want = initial.min(fl.size() - 1);
            let done = fl.refill(svc, want);
            if done.posted < want {
                log::warn!(
                    "rxq {} fl {}: posted {} of {} buffers ({:?})",
                    self.id,
                    fl.id(),
                    done.posted,
                    want,
                    done.error
                );
                complete = false;
            }
        }
        if let Some(cidx) = &mut self.cq_cidx {
            *cidx = 0;
        }
        complete
    }

    /// Processes up to `budget` completed packets.
    ///
    /// # Arguments
    /// * `svc` - Device and buffer services.
    /// * `active` - Whether the interface is still running.
    /// * `deliver` - Receives each finished packet.
    /// * `budget` - Packets to process at most, positive.
    ///
    /// # Returns
    /// `true` if more completions are waiting.
    pub(crate) fn rxeof(
        &mut self,
        svc: &Services<'_>,
        active: &dyn Fn() -> bool,
        deliver: &mut dyn FnMut(Packet),
        budget: u32,
    ) -> bool {
        debug_assert!(budget > 0);
        let refill_target = budget + RX_REFILL_SLACK;

        let mut avail = svc.dev.rxd_available(self.id, self.cidx());
        if avail == 0 {
            for fl in &mut self.fls {
                fl.refill_lt(svc, refill_target);
            }
            self.stats.unavail += 1;
            return false;
        }

        let mut completed = Vec::new();
        let mut budget_left = budget;
        while budget_left > 0 && avail > 0 {
            if !active() {
                self.stats.inactive += 1;
                break;
            }
            let cidx = self.cidx();
            self.ri.reset(self.id, cidx);
            if let Err(e) = svc.dev.rxd_pkt_get(&mut self.ri) {
                log::warn!("rxq {}: packet get at {cidx} failed: {e}", self.id);
                self.stats.pkt_get_errors += 1;
                break;
            }
            budget_left -= 1;
            avail -= 1;
            if let Some(cq) = &mut self.cq_cidx {
                *cq = increment_idx(*cq, 1, self.cq_size);
            }
            if self.ri.frags.is_empty() {
                assert!(self.cq_cidx.is_some(), "rxq {}: completion without fragments", self.id);
                self.stats.cq_only += 1;
                continue;
            }
            completed.push(self.assemble(svc.mapper));
            if avail == 0 && budget_left > 0 {
                avail = svc.dev.rxd_available(self.id, self.cidx());
            }
        }

        for fl in &mut self.fls {
            fl.refill_lt(svc, refill_target);
        }

        let mut sink = |p: Packet| deliver(p);
        for pkt in completed {
            self.stats.packets += 1;
            self.stats.bytes += pkt.len() as u64;
            match &mut self.lro {
                Some(lro) => lro.rx(pkt, &mut sink),
                None => sink(pkt),
            }
        }
        if let Some(lro) = &mut self.lro {
            lro.flush_all(&mut sink);
        }

        svc.dev.rxd_available(self.id, self.cidx()) > 0
    }

    fn assemble(&mut self, mapper: &dyn DmaMapper) -> Packet {
        let ri = &self.ri;
        let fls = &mut self.fls;
        let pad = ri.pad as usize;
        let mut pkt = Packet::new();
        for (i, frag) in ri.frags.iter().enumerate() {
            let fl = &mut fls[usize::from(frag.flid)];
            let (mut buf, mapping) = fl.take(frag.idx);
            mapper.sync_for_cpu(&mapping, buf.as_mut_slice());
            mapper.unmap(mapping);
            let off = if i == 0 { pad } else { 0 };
            let len = (frag.len as usize)
                .min(buf.capacity())
                .saturating_sub(off);
            pkt.push(Segment::new(buf, off, len));
        }
        debug_assert_eq!(pkt.len() + pad, ri.len as usize, "rxq {}: fragment lengths", self.id);
        pkt.meta = PacketMeta {
            flowid: ri.flowid,
            rss_type: ri.rss_type,
            vtag: ri.vtag,
            csum_flags: ri.csum_flags,
            csum_data: ri.csum_data,
            tso_segsz: 0,
            mcast: ri.mcast,
            bcast: ri.bcast,
        };
        pkt
    }

    /// Releases every posted buffer.
    pub(crate) fn stop(&mut self, mapper: &dyn DmaMapper) -> usize {
        let released = self.fls.iter_mut().map(|fl| fl.bufs_free(mapper)).sum();
        if let Some(cidx) = &mut self.cq_cidx {
            *cidx = 0;
        }
        released
    }

    pub fn stats(&self) -> RxQueueStats {
        RxQueueStats {
            lro: self.lro.as_ref().map(Lro::stats).unwrap_or_default(),
            free_lists: self.fls.iter().map(FreeList::stats).collect(),
            ..self.stats.clone()
        }
    }

    pub(crate) fn reset_stats(&mut self) {
        self.stats = RxQueueStats {
            id: self.id,
            ..RxQueueStats::default()
        };
        for fl in &mut self.fls {
            fl.reset_stats();
        }
    }
}
