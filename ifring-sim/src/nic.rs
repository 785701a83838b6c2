//! # Simulated NIC
//!
//! ## Purpose
//!
//! A software device behind the engine's `Device` trait. Every queue pair is
//! wired in loopback: frames the engine transmits on queue `q` come back as
//! received frames on queue `q`, so the whole TX and RX datapath runs without
//! hardware.
//!
//! ## How it works
//!
//! Descriptors are written into real descriptor rings (`desc.rs`) and packet
//! bytes only move through bus addresses of the DMA arena. A doorbell makes the
//! device fetch descriptors up to the new producer index, gather each packet
//! from SOP to EOP, count the descriptors as completed and write the frame into
//! the posted receive buffers of the same queue. Frames that do not fit the
//! posted buffers are dropped, as a NIC does when its free list runs dry.
//!
//! Interrupts go through the engine's `Interrupts` handle once it is installed
//! and only while the engine has them enabled.
//!
//! Test hooks can take the link down, stall the transmit engine so the
//! watchdog fires, and report pause frames.
//!
//! Lock order: a queue's `tx` before its `rx`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use ifring::{
    Device, DeviceError, DeviceParams, EncapError, Encapped, Interrupts, LinkState, PktInfo,
    RxFrag, RxdInfo,
};

use crate::arena::DmaArena;
use crate::desc::{DescRing, RxDesc, TXD_EOP, TXD_SOP, TXD_VLAN, TxDesc};
use crate::lock;

const ETH_P_8021Q: u16 = 0x8100;

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub nqsets: u16,
    pub ntxd: u32,
    pub nrxd: u32,
    pub tx_nsegments: u32,
    pub tx_tso_segments_max: u32,
    pub tx_reclaim_thresh: u32,
    pub max_frame_size: u32,
    /// Head padding written before every received frame.
    pub rx_pad: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            nqsets: 2,
            ntxd: 512,
            nrxd: 512,
            tx_nsegments: 8,
            tx_tso_segments_max: 16,
            tx_reclaim_thresh: 0,
            max_frame_size: 1518,
            rx_pad: 2,
        }
    }
}

impl SimConfig {
    pub fn params(&self) -> DeviceParams {
        DeviceParams {
            nqsets: self.nqsets,
            ntxd: self.ntxd,
            nrxd: self.nrxd,
            nfl: 1,
            tx_nsegments: self.tx_nsegments,
            tx_tso_segments_max: self.tx_tso_segments_max,
            tx_reclaim_thresh: self.tx_reclaim_thresh,
            max_frame_size: self.max_frame_size,
            rx_buf_size: None,
            has_cq: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NicStats {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Frames dropped for lack of posted buffers.
    pub rx_no_buffer: u64,
    pub rx_link_down: u64,
    pub doorbells: u64,
    pub bad_descriptors: u64,
    pub resets: u64,
}

struct TxHw {
    ring: DescRing<TxDesc>,
    /// Next descriptor the device fetches.
    head: u32,
    /// Producer index of the last doorbell.
    tail: u32,
    /// Completed descriptors not yet reported.
    credits: u32,
    /// Bytes of a packet whose EOP has not been fetched.
    partial: Vec<u8>,
}

struct Completion {
    frags: Vec<RxFrag>,
    len: u32,
    mcast: bool,
    bcast: bool,
}

struct RxHw {
    ring: DescRing<RxDesc>,
    /// Next posted buffer the device fills.
    head: u32,
    /// One past the last published buffer.
    tail: u32,
    done: VecDeque<Completion>,
}

struct QueueHw {
    tx: Mutex<TxHw>,
    rx: Mutex<RxHw>,
}

pub struct SimNic {
    cfg: SimConfig,
    params: DeviceParams,
    buf_size: usize,
    arena: Arc<DmaArena>,
    queues: Vec<QueueHw>,
    link: Mutex<LinkState>,
    stalled: AtomicBool,
    pause: AtomicU32,
    intr_enabled: AtomicBool,
    irq: OnceLock<Interrupts>,
    stats: Mutex<NicStats>,
}

impl SimNic {
    pub fn new(cfg: SimConfig, arena: Arc<DmaArena>) -> io::Result<Arc<Self>> {
        let params = cfg.params();
        params.validate().map_err(io::Error::other)?;
        let buf_size = params.rx_buf_size();
        if arena.frame_size() < buf_size {
            return Err(io::Error::other(format!(
                "arena frames of {} bytes cannot hold {buf_size} byte receive buffers",
                arena.frame_size()
            )));
        }
        let queues = (0..cfg.nqsets)
            .map(|_| {
                Ok(QueueHw {
                    tx: Mutex::new(TxHw {
                        ring: DescRing::new(cfg.ntxd)?,
                        head: 0,
                        tail: 0,
                        credits: 0,
                        partial: Vec::new(),
                    }),
                    rx: Mutex::new(RxHw {
                        ring: DescRing::new(cfg.nrxd)?,
                        head: 0,
                        tail: 0,
                        done: VecDeque::new(),
                    }),
                })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Arc::new(SimNic {
            cfg,
            params,
            buf_size,
            arena,
            queues,
            link: Mutex::new(LinkState::Up),
            stalled: AtomicBool::new(false),
            pause: AtomicU32::new(0),
            intr_enabled: AtomicBool::new(false),
            irq: OnceLock::new(),
            stats: Mutex::new(NicStats::default()),
        }))
    }

    /// Installs the engine's interrupt handle. Only the first call counts.
    pub fn set_interrupts(&self, irq: Interrupts) -> bool {
        self.irq.set(irq).is_ok()
    }

    pub fn set_link(&self, state: LinkState) {
        *lock(&self.link) = state;
        log::debug!("sim: link {state:?}");
        self.raise(Interrupts::admin);
    }

    /// Stops (or resumes) descriptor processing. Doorbells rung while stalled
    /// are served on resume.
    pub fn stall_tx(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
        if !stalled {
            for qid in 0..self.cfg.nqsets {
                self.kick(qid);
            }
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn inject_pause_frames(&self, n: u32) {
        self.pause.fetch_add(n, Ordering::AcqRel);
    }

    pub fn stats(&self) -> NicStats {
        *lock(&self.stats)
    }

    fn link(&self) -> LinkState {
        *lock(&self.link)
    }

    fn raise(&self, f: impl FnOnce(&Interrupts)) {
        if !self.intr_enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(irq) = self.irq.get() {
            f(irq);
        }
    }

    /// Processes queue `qid` up to its last doorbell.
    fn kick(&self, qid: u16) {
        let Some(q) = self.queues.get(usize::from(qid)) else {
            return;
        };
        let frames = {
            let mut tx = lock(&q.tx);
            if self.is_stalled() || tx.head == tx.tail {
                return;
            }
            self.fetch(&mut tx)
        };
        self.loopback(q, qid, frames);
        self.raise(|irq| irq.tx(qid));
    }

    /// Gathers every complete packet between `head` and `tail`.
    fn fetch(&self, tx: &mut TxHw) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut stats = lock(&self.stats);
        while tx.head != tx.tail {
            let d = tx.ring.get(tx.head);
            tx.head = tx.ring.next(tx.head);
            tx.credits += 1;
            if d.flags & TXD_SOP != 0 {
                tx.partial.clear();
            }
            let at = tx.partial.len();
            tx.partial.resize(at + d.len as usize, 0);
            if !self.arena.read(d.addr, &mut tx.partial[at..]) {
                log::warn!("sim: TX descriptor with bad address {:#x}", d.addr);
                stats.bad_descriptors += 1;
                tx.partial.clear();
                continue;
            }
            if d.flags & TXD_EOP != 0 {
                let mut frame = std::mem::take(&mut tx.partial);
                if d.flags & TXD_VLAN != 0 {
                    insert_vlan(&mut frame, d.vtag);
                }
                stats.tx_frames += 1;
                stats.tx_bytes += frame.len() as u64;
                frames.push(frame);
            }
        }
        frames
    }

    fn loopback(&self, q: &QueueHw, qid: u16, frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        let link_up = self.link() == LinkState::Up;
        let mut received = 0;
        {
            let mut rx = lock(&q.rx);
            let mut stats = lock(&self.stats);
            for frame in frames {
                if !link_up {
                    stats.rx_link_down += 1;
                } else if self.receive(&mut rx, &frame) {
                    stats.rx_frames += 1;
                    stats.rx_bytes += frame.len() as u64;
                    received += 1;
                } else {
                    stats.rx_no_buffer += 1;
                }
            }
        }
        if received > 0 {
            self.raise(|irq| irq.rx(qid));
        }
    }

    /// Writes `frame` into posted buffers starting at `head`.
    fn receive(&self, rx: &mut RxHw, frame: &[u8]) -> bool {
        let pad = self.cfg.rx_pad as usize;
        let total = pad + frame.len();
        let need = total.div_ceil(self.buf_size) as u32;
        let posted = rx.tail.wrapping_sub(rx.head) & (rx.ring.len() - 1);
        if posted < need {
            return false;
        }
        let mut frags = Vec::with_capacity(need as usize);
        let mut off = 0;
        for i in 0..need {
            let idx = rx.head;
            let addr = rx.ring.get(idx).addr;
            rx.head = rx.ring.next(idx);
            let lead = if i == 0 { pad } else { 0 };
            let end = (off + self.buf_size - lead).min(frame.len());
            let chunk = &frame[off..end];
            if !self.arena.write(addr + lead as u64, chunk) {
                log::warn!("sim: RX buffer with bad address {addr:#x}");
            }
            frags.push(RxFrag {
                flid: 0,
                idx,
                len: (lead + chunk.len()) as u32,
            });
            off = end;
        }
        let dst = frame.get(..6).unwrap_or_default();
        rx.done.push_back(Completion {
            frags,
            len: total as u32,
            mcast: dst.first().is_some_and(|b| b & 1 != 0),
            bcast: dst.len() == 6 && dst.iter().all(|&b| b == 0xff),
        });
        true
    }

    fn reset_queues(&self) {
        for q in &self.queues {
            let mut tx = lock(&q.tx);
            tx.ring.clear();
            tx.head = 0;
            tx.tail = 0;
            tx.credits = 0;
            tx.partial.clear();
            drop(tx);
            let mut rx = lock(&q.rx);
            rx.ring.clear();
            rx.head = 0;
            rx.tail = 0;
            rx.done.clear();
        }
    }
}

/// Inserts an 802.1Q tag after the MAC addresses.
fn insert_vlan(frame: &mut Vec<u8>, vtag: u16) {
    if frame.len() < 12 {
        return;
    }
    let mut tag = [0u8; 4];
    tag[..2].copy_from_slice(&ETH_P_8021Q.to_be_bytes());
    tag[2..].copy_from_slice(&vtag.to_be_bytes());
    frame.splice(12..12, tag);
}

impl Device for SimNic {
    fn params(&self) -> DeviceParams {
        self.params
    }

    fn txd_encap(&self, pi: &PktInfo<'_>) -> Result<Encapped, EncapError> {
        let n = pi.segs.len() as u32;
        let limit = if pi.csum_flags.is_tso() {
            self.cfg.tx_tso_segments_max
        } else {
            self.cfg.tx_nsegments
        };
        if n == 0 {
            return Err(EncapError::Invalid);
        }
        if n > limit {
            return Err(EncapError::TooManySegments);
        }
        let q = self
            .queues
            .get(usize::from(pi.qsidx))
            .ok_or(EncapError::Invalid)?;
        let mut tx = lock(&q.tx);
        let mask = tx.ring.len() - 1;
        for (i, seg) in pi.segs.iter().enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= TXD_SOP;
            }
            if i + 1 == pi.segs.len() {
                flags |= TXD_EOP;
            }
            if pi.vtag.is_some() {
                flags |= TXD_VLAN;
            }
            tx.ring.set(
                (pi.pidx + i as u32) & mask,
                TxDesc {
                    addr: seg.addr,
                    len: seg.len,
                    flags,
                    vtag: pi.vtag.unwrap_or(0),
                },
            );
        }
        Ok(Encapped {
            new_pidx: (pi.pidx + n) & mask,
            ndescs: n,
        })
    }

    fn txd_flush(&self, qid: u16, pidx: u32) {
        let Some(q) = self.queues.get(usize::from(qid)) else {
            return;
        };
        lock(&q.tx).tail = pidx;
        lock(&self.stats).doorbells += 1;
        self.kick(qid);
    }

    fn txd_credits_update(&self, qid: u16, _cidx: u32, clear: bool) -> u32 {
        let Some(q) = self.queues.get(usize::from(qid)) else {
            return 0;
        };
        let mut tx = lock(&q.tx);
        let n = tx.credits;
        if clear {
            tx.credits = 0;
        }
        n
    }

    fn rxd_available(&self, qid: u16, _cidx: u32) -> u32 {
        self.queues
            .get(usize::from(qid))
            .map_or(0, |q| lock(&q.rx).done.len() as u32)
    }

    fn rxd_pkt_get(&self, ri: &mut RxdInfo) -> Result<(), DeviceError> {
        let q = self
            .queues
            .get(usize::from(ri.qsidx))
            .ok_or_else(|| DeviceError::Failed(format!("no queue {}", ri.qsidx)))?;
        let c = lock(&q.rx).done.pop_front().ok_or(DeviceError::NoPacket)?;
        ri.frags = c.frags;
        ri.len = c.len;
        ri.pad = self.cfg.rx_pad;
        ri.mcast = c.mcast;
        ri.bcast = c.bcast;
        Ok(())
    }

    fn rxd_refill(&self, qid: u16, _flid: u8, pidx: u32, addrs: &[u64]) {
        let Some(q) = self.queues.get(usize::from(qid)) else {
            return;
        };
        let mut rx = lock(&q.rx);
        let mask = rx.ring.len() - 1;
        for (i, &addr) in addrs.iter().enumerate() {
            rx.ring.set((pidx + i as u32) & mask, RxDesc { addr, rsvd: 0 });
        }
    }

    fn rxd_flush(&self, qid: u16, _flid: u8, pidx: u32) {
        if let Some(q) = self.queues.get(usize::from(qid)) {
            let mut rx = lock(&q.rx);
            rx.tail = rx.ring.next(pidx);
        }
    }

    fn update_admin_status(&self) -> LinkState {
        self.link()
    }

    fn init(&self) {
        self.reset_queues();
        log::debug!("sim: init, {} queue pairs", self.cfg.nqsets);
    }

    fn stop(&self) {
        self.reset_queues();
    }

    fn detach(&self) {
        log::debug!("sim: detached, {:?}", self.stats());
    }

    fn intr_enable(&self) {
        self.intr_enabled.store(true, Ordering::Release);
    }

    fn intr_disable(&self) {
        self.intr_enabled.store(false, Ordering::Release);
    }

    fn watchdog_reset(&self) {
        lock(&self.stats).resets += 1;
        self.stalled.store(false, Ordering::Release);
    }

    fn pause_frames(&self) -> u32 {
        self.pause.swap(0, Ordering::AcqRel)
    }
}
