//! # Device Capability Set
//!
//! ## Purpose
//!
//! The engine is hardware agnostic. Everything register-level (descriptor
//! layout, doorbells, completion reporting) lives behind the `Device` trait that
//! a backend implements. The engine only calls the operations below.
//!
//! ## How it works
//!
//! Datapath operations are called from the TX drain routine and the RX task
//! with the queue id they apply to; a backend keeps per-queue state behind its
//! own synchronisation. Admin hooks are called by the orchestrator with the
//! interface stopped or under its admin lock, and default to no-ops.
//!
//! ## Main components
//!
//! - `Device`: the capability trait.
//! - `DeviceParams`: ring geometry and limits reported by the backend.
//! - `PktInfo`/`Encapped`: the TX encap request and its result.
//! - `RxdInfo`/`RxFrag`: the RX packet-get request and its fragment list.

use crate::buf::CsumFlags;
use crate::dma::DmaSeg;
use crate::error::{DeviceError, EncapError, EngineError};
use crate::parse::HeaderInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Unknown,
    Down,
    Up,
}

/// Queue geometry and limits of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParams {
    /// Number of TX/RX queue pairs.
    pub nqsets: u16,
    /// TX descriptors per queue, power of two.
    pub ntxd: u32,
    /// RX descriptors per free list, power of two.
    pub nrxd: u32,
    /// Free lists per RX queue.
    pub nfl: u8,
    /// Scatter/gather limit for ordinary packets.
    pub tx_nsegments: u32,
    /// Scatter/gather limit for TSO packets; also the largest number of
    /// descriptors one packet may take.
    pub tx_tso_segments_max: u32,
    /// Completed descriptors to accumulate before reclaiming them.
    pub tx_reclaim_thresh: u32,
    pub max_frame_size: u32,
    /// Receive buffer size. Derived from `max_frame_size` when `None`.
    pub rx_buf_size: Option<u32>,
    /// RX completions are reported on a separate completion queue.
    pub has_cq: bool,
}

impl DeviceParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::InvalidParams(msg));
        if self.nqsets == 0 {
            return fail("nqsets must be positive".into());
        }
        if !self.ntxd.is_power_of_two() || self.ntxd < 4 {
            return fail(format!("ntxd {} is not a power of two >= 4", self.ntxd));
        }
        if !self.nrxd.is_power_of_two() || self.nrxd < 2 {
            return fail(format!("nrxd {} is not a power of two >= 2", self.nrxd));
        }
        if self.nfl == 0 {
            return fail("nfl must be positive".into());
        }
        if self.tx_nsegments == 0 || self.tx_tso_segments_max < self.tx_nsegments {
            return fail(format!(
                "segment limits {}/{} are inconsistent",
                self.tx_nsegments, self.tx_tso_segments_max
            ));
        }
        if self.tx_tso_segments_max + 2 >= self.ntxd {
            return fail(format!(
                "ntxd {} cannot hold a {}-descriptor packet",
                self.ntxd, self.tx_tso_segments_max
            ));
        }
        if self.tx_reclaim_thresh >= self.ntxd {
            return fail(format!(
                "reclaim threshold {} >= ntxd {}",
                self.tx_reclaim_thresh, self.ntxd
            ));
        }
        if self.rx_buf_size == Some(0) {
            return fail("rx_buf_size must be positive".into());
        }
        Ok(())
    }

    /// Receive buffer size used by the free lists.
    pub fn rx_buf_size(&self) -> usize {
        if let Some(size) = self.rx_buf_size {
            return size as usize;
        }
        match self.max_frame_size {
            0..=2048 => 2048,
            2049..=4096 => 4096,
            4097..=9216 => 9216,
            _ => 16384,
        }
    }
}

/// A packet handed to `txd_encap`.
#[derive(Debug, Clone)]
pub struct PktInfo<'a> {
    pub qsidx: u16,
    /// First descriptor the device may write.
    pub pidx: u32,
    pub segs: &'a [DmaSeg],
    pub len: u32,
    pub csum_flags: CsumFlags,
    pub vtag: Option<u16>,
    pub tso_segsz: u16,
    pub mcast: bool,
    pub bcast: bool,
    /// Header layout, present when offloads or a VLAN tag were requested.
    pub header: Option<HeaderInfo>,
}

/// Result of a successful encap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encapped {
    /// Producer index after the written descriptors.
    pub new_pidx: u32,
    /// Descriptors that still need a doorbell.
    pub ndescs: u32,
}

/// One receive fragment: free list, slot and bytes written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFrag {
    pub flid: u8,
    pub idx: u32,
    pub len: u32,
}

/// Packet-get request, filled in by the device.
#[derive(Debug, Default)]
pub struct RxdInfo {
    pub qsidx: u16,
    /// Consumer index of the completion source.
    pub cidx: u32,
    pub frags: Vec<RxFrag>,
    /// Bytes written including `pad`.
    pub len: u32,
    /// Bytes of head padding in the first fragment.
    pub pad: u32,
    pub vtag: Option<u16>,
    pub flowid: Option<u32>,
    pub rss_type: u8,
    pub csum_flags: CsumFlags,
    pub csum_data: u32,
    pub mcast: bool,
    pub bcast: bool,
}

impl RxdInfo {
    pub(crate) fn reset(&mut self, qsidx: u16, cidx: u32) {
        let mut frags = std::mem::take(&mut self.frags);
        frags.clear();
        *self = RxdInfo {
            qsidx,
            cidx,
            frags,
            ..RxdInfo::default()
        };
    }
}

/// Operations a hardware backend provides.
pub trait Device: Send + Sync {
    fn params(&self) -> DeviceParams;

    /// Writes descriptors for one packet starting at `pi.pidx`.
    fn txd_encap(&self, pi: &PktInfo<'_>) -> Result<Encapped, EncapError>;

    /// Rings the TX doorbell. Must tolerate an unchanged `pidx`.
    fn txd_flush(&self, qid: u16, pidx: u32);

    /// Descriptors completed since `cidx`. With `clear` the count is consumed.
    fn txd_credits_update(&self, qid: u16, cidx: u32, clear: bool) -> u32;

    /// Completed receive packets waiting at `cidx`.
    fn rxd_available(&self, qid: u16, cidx: u32) -> u32;

    fn rxd_pkt_get(&self, ri: &mut RxdInfo) -> Result<(), DeviceError>;

    /// Posts `addrs` to free list `flid` starting at `pidx`.
    fn rxd_refill(&self, qid: u16, flid: u8, pidx: u32, addrs: &[u64]);

    /// Publishes refilled buffers up to and including `pidx`.
    fn rxd_flush(&self, qid: u16, flid: u8, pidx: u32);

    fn update_admin_status(&self) -> LinkState;

    fn init(&self) {}

    fn stop(&self) {}

    fn detach(&self) {}

    fn intr_enable(&self) {}

    fn intr_disable(&self) {}

    fn queue_intr_enable(&self, _qid: u16) {}

    fn link_intr_enable(&self) {}

    /// Periodic per-queue hook, called from the watchdog.
    fn timer(&self, _qid: u16) {}

    fn watchdog_reset(&self) {}

    /// Pause frames received since the last call.
    fn pause_frames(&self) -> u32 {
        0
    }
}
