//! # Transmit Queue
//!
//! ## Purpose
//!
//! One transmit queue: the multi-producer submission ring the stack enqueues
//! into, the hardware descriptor ring mirror the drain routine writes, the
//! slot table holding packets until the device completes them, and the
//! doorbell and watchdog state around them.
//!
//! ## How it works
//!
//! The submission ring calls [`Consumer::drain`] on whichever thread claimed
//! the consumer role. A drain first reclaims completed descriptors, then
//! encodes up to one batch of packets through `txd_encap`. Packets that need
//! too many DMA segments are collapsed, then defragmented, then dropped.
//! Running out of descriptors leaves the packet in the submission ring and
//! schedules the queue's TX task, so nothing accepted is lost.
//!
//! Doorbells are coalesced according to [`DoorbellPolicy`]: a pending count
//! over the threshold rings at once, a nearly empty hardware ring rings at the
//! end of the batch, and anything else arms a one-shot callout.
//!
//! ## Main components
//!
//! - `TxQueue`: the queue and its drain routine.
//! - `TxCounters`/`TxQueueStats`: counters and a snapshot of the queue.
//! - `QueueState`: the per-queue Idle/Active/Hung state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::buf::{CsumFlags, Packet};
use crate::config::{DOORBELL_RESTART_BUDGET, DoorbellPolicy};
use crate::context::Shared;
use crate::device::PktInfo;
use crate::dma::Mapping;
use crate::error::{EncapError, MapError, SubmitError};
use crate::mp_ring::{Consumer, Items, MpRing, RingState, RingStats};
use crate::parse::{MAX_HDR_LEN, parse_header};
use crate::ring::{RingIndex, increment_idx};
use crate::slot::SlotTable;
use crate::taskq::GroupTask;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    #[default]
    Idle = 0,
    Active = 1,
    Hung = 2,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => QueueState::Active,
            2 => QueueState::Hung,
            _ => QueueState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCounters {
    pub packets: u64,
    pub bytes: u64,
    pub mcast: u64,
    /// Packets put back because the hardware ring was full.
    pub no_desc_avail: u64,
    pub no_tx_dma_setup: u64,
    pub defrag: u64,
    pub defrag_failed: u64,
    pub map_failed: u64,
    /// Device rejected the segment count.
    pub encap_efbig: u64,
    /// Offload headers could not be parsed.
    pub encap_invalid: u64,
    pub encap_failed: u64,
    /// Submissions dropped by a queue flush.
    pub flushed: u64,
    pub doorbells: u64,
    /// Descriptors returned by the device.
    pub reclaimed: u64,
    /// Drain calls skipped because the interface or link was down.
    pub not_ready: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxQueueStats {
    pub id: u16,
    pub state: QueueState,
    pub closed: bool,
    pub ring: RingStats,
    pub size: u32,
    pub in_use: u32,
    pub pidx: u32,
    pub cidx: u32,
    pub processed: u32,
    pub cleaned: u32,
    pub db_pending: u32,
    pub counters: TxCounters,
    pub task_runs: u64,
}

#[derive(Debug, Default)]
struct Watchdog {
    last_processed: u32,
    last_cleaned: u32,
    strikes: u32,
}

/// State owned by the single drain/reclaim writer.
struct TxHw {
    ring: RingIndex,
    /// Descriptors the device reported complete, wrapping.
    processed: u32,
    /// Descriptors reclaimed, wrapping.
    cleaned: u32,
    /// Ring index `processed` corresponds to.
    cidx_processed: u32,
    /// Descriptors written since the last doorbell.
    db_pending: u32,
    /// Device-reported descriptors awaiting the doorbell.
    npending: u32,
    sds: SlotTable<Packet>,
    stats: TxCounters,
    wd: Watchdog,
}

impl TxHw {
    fn new(size: u32) -> Self {
        TxHw {
            ring: RingIndex::new(size),
            processed: 0,
            cleaned: 0,
            cidx_processed: 0,
            db_pending: 0,
            npending: 0,
            sds: SlotTable::create(size as usize),
            stats: TxCounters::default(),
            wd: Watchdog::default(),
        }
    }
}

/// Outcome of encoding one submission.
enum Sent {
    Queued,
    Dropped,
    NoDescriptors,
}

pub struct TxQueue {
    id: u16,
    me: Weak<TxQueue>,
    shared: Arc<Shared>,
    ring: MpRing<Packet>,
    hw: Mutex<TxHw>,
    state: AtomicU8,
    closed: AtomicBool,
    db_armed: AtomicBool,
    task: Arc<GroupTask>,
}

impl TxQueue {
    pub(crate) fn new(id: u16, shared: Arc<Shared>) -> Arc<Self> {
        let ring = MpRing::new(shared.tun.submit_ring_size);
        let hw = TxHw::new(shared.params.ntxd);
        Arc::new_cyclic(|me| TxQueue {
            id,
            me: me.clone(),
            shared,
            ring,
            hw: Mutex::new(hw),
            state: AtomicU8::new(QueueState::Idle as u8),
            closed: AtomicBool::new(false),
            db_armed: AtomicBool::new(false),
            task: GroupTask::new(format!("txq{id}")),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn task(&self) -> &Arc<GroupTask> {
        &self.task
    }

    fn lock_hw(&self) -> MutexGuard<'_, TxHw> {
        crate::lock(&self.hw)
    }

    fn max_tx_desc(&self) -> u32 {
        self.shared.params.tx_tso_segments_max
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Hardware descriptors in use.
    pub fn in_use(&self) -> u32 {
        self.lock_hw().ring.in_use()
    }

    /// Free hardware descriptors.
    pub fn avail(&self) -> u32 {
        self.lock_hw().ring.avail()
    }

    pub fn ring_state(&self) -> RingState {
        self.ring.state()
    }

    /// Hands a batch to the submission ring.
    ///
    /// # Errors
    /// `Closed` after detach started, `Full` when the batch does not fit.
    /// Either way the batch comes back untouched.
    pub(crate) fn transmit(&self, pkts: Vec<Packet>) -> Result<(), SubmitError> {
        if self.is_closed() {
            return Err(SubmitError::Closed(pkts));
        }
        let tun = &self.shared.tun;
        match self.ring.enqueue(pkts, tun.tx_budget, tun.abdicate, self) {
            Ok(()) => {
                if tun.abdicate {
                    self.task.enqueue();
                }
                Ok(())
            }
            Err(pkts) => {
                self.ring.check_drainage(tun.tx_batch, self);
                Err(SubmitError::Full(pkts))
            }
        }
    }

    /// Restarts a stalled or abdicated submission ring.
    pub(crate) fn check_drain(&self, budget: u32) {
        self.ring.check_drainage(budget, self);
    }

    /// Body of the queue's TX task.
    pub(crate) fn tx_task(&self) {
        if self.ring.is_idle() {
            let mut hw = self.lock_hw();
            if hw.ring.in_use() > 0 {
                self.reclaim(&mut hw, 0);
            }
        }
        self.check_drain(self.shared.tun.tx_budget);
    }

    /// Drops every queued submission. The caller has raised the flush flag.
    pub(crate) fn flush(&self) {
        loop {
            match self.ring.state() {
                RingState::Idle => break,
                RingState::Stalled | RingState::Abdicated => self.ring.check_drainage(0, self),
                RingState::Busy => {}
            }
            std::thread::yield_now();
        }
    }

    /// Asks the device how many descriptors completed since `cidx_processed`.
    /// With `clear` the completions are consumed and accounted as processed.
    fn credits_update(&self, hw: &mut TxHw, clear: bool) -> u32 {
        let credits = self
            .shared
            .dev
            .txd_credits_update(self.id, hw.cidx_processed, clear);
        if clear && credits > 0 {
            hw.processed = hw.processed.wrapping_add(credits);
            hw.cidx_processed = increment_idx(hw.cidx_processed, credits % hw.ring.size(), hw.ring.size());
        }
        credits
    }

    /// Completed descriptors not yet reclaimed, or 0 if at most `thresh`.
    fn reclaimable(&self, hw: &mut TxHw, thresh: u32) -> u32 {
        self.credits_update(hw, true);
        let reclaim = hw.processed.wrapping_sub(hw.cleaned);
        if reclaim <= thresh { 0 } else { reclaim }
    }

    /// Frees completed descriptors in consumer order.
    ///
    /// # Returns
    /// Descriptors reclaimed.
    fn reclaim(&self, hw: &mut TxHw, thresh: u32) -> u32 {
        let mut n = self.reclaimable(hw, thresh);
        if n == 0 {
            return 0;
        }
        let in_use = hw.ring.in_use();
        if n > in_use {
            log::error!(
                "txq {}: device completed {n} descriptors with only {in_use} in use",
                self.id
            );
            n = in_use;
            hw.cleaned = hw.processed.wrapping_sub(n);
        }
        let size = hw.ring.size();
        let mapper = &*self.shared.mapper;
        let mut cidx = hw.ring.cidx();
        for _ in 0..n {
            if let Some((pkt, mapping)) = hw.sds.release(cidx as usize) {
                mapper.unmap(mapping);
                drop(pkt);
            }
            cidx = increment_idx(cidx, 1, size);
        }
        hw.ring.consume(n);
        hw.cleaned = hw.cleaned.wrapping_add(n);
        hw.stats.reclaimed += u64::from(n);
        n
    }

    fn ring_doorbell(&self, hw: &mut TxHw) {
        self.shared.dev.txd_flush(self.id, hw.ring.pidx());
        hw.db_pending = 0;
        hw.npending = 0;
        hw.stats.doorbells += 1;
    }

    /// Rings the doorbell once enough descriptors are pending.
    fn db_check(&self, hw: &mut TxHw) {
        if let DoorbellPolicy::Deferred { threshold, .. } = self.shared.tun.doorbell {
            if hw.db_pending >= threshold {
                self.ring_doorbell(hw);
            }
        }
    }

    /// Doorbell decision at the end of a drain batch.
    fn finish_batch(&self, hw: &mut TxHw) {
        let pending = hw.db_pending > 0;
        match self.shared.tun.doorbell {
            DoorbellPolicy::Immediate => {
                if pending {
                    self.ring_doorbell(hw);
                }
            }
            DoorbellPolicy::Deferred {
                min_occupancy,
                delay,
                ..
            } => {
                let max_desc = self.max_tx_desc();
                if pending && hw.ring.in_use() < min_occupancy + max_desc {
                    self.ring_doorbell(hw);
                } else if (pending || hw.ring.avail() < max_desc) && !self.arm_doorbell(delay) && pending {
                    self.ring_doorbell(hw);
                }
            }
        }
    }

    /// Arms the one-shot doorbell callout.
    ///
    /// # Returns
    /// `false` when no runtime is available to run it.
    fn arm_doorbell(&self, delay: std::time::Duration) -> bool {
        if self.db_armed.swap(true, Ordering::AcqRel) {
            return true;
        }
        let me = self.me.clone();
        let token = self.shared.timer_token();
        let spawned = self.shared.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(txq) = me.upgrade() {
                        txq.doorbell_cancelled();
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    if let Some(txq) = me.upgrade() {
                        txq.doorbell_callout();
                    }
                }
            }
        });
        if !spawned {
            self.db_armed.store(false, Ordering::Release);
        }
        spawned
    }

    fn doorbell_callout(&self) {
        self.db_armed.store(false, Ordering::Release);
        {
            let mut hw = self.lock_hw();
            if hw.db_pending > 0 {
                self.ring_doorbell(&mut hw);
            }
        }
        self.check_drain(DOORBELL_RESTART_BUDGET);
    }

    /// A timer restart cancelled the armed callout. Whatever it was holding
    /// back is rung now so the callout can be armed again.
    fn doorbell_cancelled(&self) {
        self.db_armed.store(false, Ordering::Release);
        if !self.shared.is_running() {
            return;
        }
        let mut hw = self.lock_hw();
        if hw.db_pending > 0 {
            self.ring_doorbell(&mut hw);
        }
    }

    /// Gives an oversized packet its next chance: collapse, then defrag.
    ///
    /// # Returns
    /// The reshaped packet, or `None` once it was dropped.
    fn remap(&self, hw: &mut TxHw, pkt: Packet, remap: &mut u32, max_segs: usize) -> Option<Packet> {
        let mut pkt = pkt;
        if *remap == 0 {
            *remap = 1;
            match pkt.collapse(max_segs) {
                Ok(p) => return Some(p),
                Err(p) => pkt = p,
            }
        }
        if *remap == 1 {
            *remap = 2;
            match pkt.defrag(&*self.shared.pool) {
                Ok(p) => {
                    hw.stats.defrag += 1;
                    return Some(p);
                }
                Err(_) => {
                    log::debug!("txq {}: defrag failed, dropping packet", self.id);
                    hw.stats.defrag_failed += 1;
                    hw.stats.map_failed += 1;
                    return None;
                }
            }
        }
        hw.stats.map_failed += 1;
        None
    }

    /// Maps and encodes the packet in `slot`. On `NoDescriptors` the packet is
    /// left in the slot.
    fn encap(&self, hw: &mut TxHw, slot: &mut Option<Packet>) -> Sent {
        let Some(mut pkt) = slot.take() else {
            return Sent::Dropped;
        };
        let sh = &*self.shared;
        let meta = pkt.meta;
        let tso = meta.csum_flags.is_tso();
        let max_segs = if tso {
            sh.params.tx_tso_segments_max
        } else {
            sh.params.tx_nsegments
        } as usize;

        let need_l3 = meta.csum_flags.intersects(CsumFlags::TX_OFFLOAD);
        let header = if need_l3 || meta.vtag.is_some() {
            match parse_header(&pkt.copy_head(MAX_HDR_LEN), need_l3, tso) {
                Ok(h) => Some(h),
                Err(e) => {
                    log::debug!("txq {}: dropping packet: {e}", self.id);
                    hw.stats.encap_invalid += 1;
                    return Sent::Dropped;
                }
            }
        } else {
            None
        };

        let mut remap = 0;
        loop {
            let mapped = sh.mapper.map(&pkt.fragments(), max_segs);
            let mapping = match mapped {
                Ok(m) => m,
                Err(MapError::TooManySegments) => match self.remap(hw, pkt, &mut remap, max_segs) {
                    Some(p) => {
                        pkt = p;
                        continue;
                    }
                    None => return Sent::Dropped,
                },
                Err(e) => {
                    log::debug!("txq {}: mapping failed: {e}", self.id);
                    hw.stats.no_tx_dma_setup += 1;
                    hw.stats.map_failed += 1;
                    return Sent::Dropped;
                }
            };

            let nsegs = mapping.segs().len() as u32;
            if nsegs + 2 > hw.ring.avail() {
                hw.stats.no_desc_avail += 1;
                sh.mapper.unmap(mapping);
                *slot = Some(pkt);
                self.task.enqueue();
                return Sent::NoDescriptors;
            }

            let pidx = hw.ring.pidx();
            let res = sh.dev.txd_encap(&PktInfo {
                qsidx: self.id,
                pidx,
                segs: mapping.segs(),
                len: pkt.len() as u32,
                csum_flags: meta.csum_flags,
                vtag: meta.vtag,
                tso_segsz: meta.tso_segsz,
                mcast: meta.mcast,
                bcast: meta.bcast,
                header,
            });
            match res {
                Ok(done) => {
                    self.commit(hw, pidx, pkt, mapping, done.new_pidx, done.ndescs);
                    return Sent::Queued;
                }
                Err(EncapError::TooManySegments) => {
                    hw.stats.encap_efbig += 1;
                    sh.mapper.unmap(mapping);
                    // the mapping already fits the segment limit, so only a
                    // defrag can help
                    remap = remap.max(1);
                    match self.remap(hw, pkt, &mut remap, max_segs) {
                        Some(p) => pkt = p,
                        None => return Sent::Dropped,
                    }
                }
                Err(EncapError::NoDescriptors) => {
                    hw.stats.no_desc_avail += 1;
                    sh.mapper.unmap(mapping);
                    *slot = Some(pkt);
                    return Sent::NoDescriptors;
                }
                Err(EncapError::Invalid) => {
                    log::debug!("txq {}: device rejected packet", self.id);
                    hw.stats.encap_failed += 1;
                    sh.mapper.unmap(mapping);
                    return Sent::Dropped;
                }
            }
        }
    }

    fn commit(&self, hw: &mut TxHw, pidx: u32, pkt: Packet, mapping: Mapping, new_pidx: u32, ndescs: u32) {
        let len = pkt.len() as u64;
        let mcast = pkt.meta.mcast;
        if let Err(e) = hw.sds.bind(pidx as usize, pkt, mapping) {
            panic!("txq {}: {e}", self.id);
        }
        let used = hw.ring.produce_to(new_pidx);
        hw.db_pending += used;
        hw.npending += ndescs;
        hw.stats.packets += 1;
        hw.stats.bytes += len;
        if mcast {
            hw.stats.mcast += 1;
        }
    }

    /// Counts a watchdog tick.
    ///
    /// A tick with descriptors in use, no new completions and no progress
    /// since the previous tick is a strike; `watchdog_checks` strikes in a row
    /// mark the queue `Hung`.
    pub(crate) fn watchdog_check(&self) -> QueueState {
        let state = self.state();
        if state != QueueState::Active {
            return state;
        }
        let mut hw = self.lock_hw();
        let (processed, cleaned) = (hw.processed, hw.cleaned);
        let idle = hw.ring.in_use() == 0 || !self.shared.link_up();
        let progressed = idle
            || processed != hw.wd.last_processed
            || cleaned != hw.wd.last_cleaned
            || self.credits_update(&mut hw, false) > 0;
        hw.wd.last_processed = processed;
        hw.wd.last_cleaned = cleaned;
        if progressed {
            hw.wd.strikes = 0;
            return QueueState::Active;
        }
        hw.wd.strikes += 1;
        if hw.wd.strikes < self.shared.tun.watchdog_checks {
            return QueueState::Active;
        }
        log::warn!(
            "txq {}: no completions for {} checks, {} descriptors in use at cidx {}",
            self.id,
            hw.wd.strikes,
            hw.ring.in_use(),
            hw.ring.cidx()
        );
        self.set_state(QueueState::Hung);
        QueueState::Hung
    }

    /// Withdraws a hang suspicion.
    pub(crate) fn clear_hang(&self) {
        self.lock_hw().wd.strikes = 0;
        let _ = self.state.compare_exchange(
            QueueState::Hung as u8,
            QueueState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the watchdog should kick the TX task.
    pub(crate) fn needs_service(&self) -> bool {
        let hw = self.lock_hw();
        hw.ring.avail() <= 2 * self.shared.params.tx_nsegments
            || hw.ring.in_use() > 0
            || self.ring.is_stalled()
    }

    pub(crate) fn desc_info(&self) -> (u32, u32) {
        let hw = self.lock_hw();
        (hw.ring.avail(), hw.ring.pidx())
    }

    pub(crate) fn start(&self) {
        self.lock_hw().wd = Watchdog::default();
        self.set_state(QueueState::Active);
    }

    /// Final forced reclamation before the device stops.
    pub(crate) fn reclaim_all(&self) -> u32 {
        let mut hw = self.lock_hw();
        self.reclaim(&mut hw, 0)
    }

    /// Releases every in-flight packet and resets the ring and counters.
    ///
    /// # Returns
    /// Packets that were still in flight.
    pub(crate) fn stop(&self) -> usize {
        self.db_armed.store(false, Ordering::Release);
        let mut hw = self.lock_hw();
        let released = hw.sds.destroy(&*self.shared.mapper);
        if released > 0 {
            log::debug!("txq {}: released {released} in-flight packets", self.id);
        }
        hw.ring.reset();
        hw.processed = 0;
        hw.cleaned = 0;
        hw.cidx_processed = 0;
        hw.db_pending = 0;
        hw.npending = 0;
        hw.stats = TxCounters::default();
        hw.wd = Watchdog::default();
        drop(hw);
        self.ring.reset_stats();
        self.set_state(QueueState::Idle);
        released
    }

    pub fn stats(&self) -> TxQueueStats {
        let hw = self.lock_hw();
        TxQueueStats {
            id: self.id,
            state: self.state(),
            closed: self.is_closed(),
            ring: self.ring.stats(),
            size: hw.ring.size(),
            in_use: hw.ring.in_use(),
            pidx: hw.ring.pidx(),
            cidx: hw.ring.cidx(),
            processed: hw.processed,
            cleaned: hw.cleaned,
            db_pending: hw.db_pending,
            counters: hw.stats,
            task_runs: self.task.runs(),
        }
    }
}

impl Consumer<Packet> for TxQueue {
    fn drain(&self, mut items: Items<'_, Packet>) -> u32 {
        let avail = items.len();
        let sh = &*self.shared;
        let mut hw = self.lock_hw();

        if sh.is_flushing() {
            for i in 0..avail {
                if items.take(i).is_some() {
                    hw.stats.flushed += 1;
                }
            }
            return avail;
        }

        self.reclaim(&mut hw, sh.params.tx_reclaim_thresh);
        if sh.is_oactive() || !sh.is_running() || !sh.link_up() {
            hw.stats.not_ready += 1;
            return 0;
        }

        let count = avail.min(sh.tun.tx_batch);
        let low_water = self.max_tx_desc() + 2;
        let mut consumed = 0;
        let mut reschedule = false;
        for i in 0..count {
            if hw.ring.avail() < low_water {
                self.reclaim(&mut hw, 0);
                if hw.ring.avail() < low_water {
                    reschedule = true;
                    break;
                }
            }
            match self.encap(&mut hw, items.slot(i)) {
                Sent::Queued => {
                    consumed += 1;
                    self.db_check(&mut hw);
                }
                Sent::Dropped => consumed += 1,
                Sent::NoDescriptors => {
                    reschedule = true;
                    break;
                }
            }
        }
        if reschedule {
            self.task.enqueue();
        }
        self.finish_batch(&mut hw);
        consumed
    }

    fn can_drain(&self) -> bool {
        if self.shared.is_flushing() {
            return true;
        }
        let mut hw = self.lock_hw();
        hw.ring.avail() >= self.max_tx_desc() || self.credits_update(&mut hw, false) > 0
    }
}
