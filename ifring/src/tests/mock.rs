use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buf::{Buffer, BufferPool, Packet, Recycle, Segment};
use crate::config::{EngineConfig, Tunables};
use crate::context::{Shared, Stack};
use crate::device::{Device, DeviceParams, Encapped, LinkState, PktInfo, RxFrag, RxdInfo};
use crate::dma::{DmaMapper, DmaSeg, Mapping};
use crate::error::{DeviceError, EncapError, MapError};

pub fn params() -> DeviceParams {
    DeviceParams {
        nqsets: 1,
        ntxd: 16,
        nrxd: 8,
        nfl: 1,
        tx_nsegments: 4,
        tx_tso_segments_max: 4,
        tx_reclaim_thresh: 0,
        max_frame_size: 1518,
        rx_buf_size: None,
        has_cq: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapCall {
    pub qid: u16,
    pub pidx: u32,
    pub nsegs: usize,
    pub len: u32,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub encaps: Vec<EncapCall>,
    pub tx_flushes: Vec<(u16, u32)>,
    /// (qid, flid, pidx, addresses)
    pub refills: Vec<(u16, u8, u32, usize)>,
    pub rx_flushes: Vec<(u16, u8, u32)>,
    pub inits: u32,
    pub stops: u32,
    pub detaches: u32,
    pub watchdog_resets: u32,
    pub queue_intr_enables: u32,
}

/// A completed receive packet the mock reports.
#[derive(Debug, Clone)]
pub struct MockRx {
    pub frags: Vec<RxFrag>,
    pub pad: u32,
}

impl MockRx {
    pub fn single(idx: u32, len: u32) -> Self {
        MockRx {
            frags: vec![RxFrag { flid: 0, idx, len }],
            pad: 0,
        }
    }
}

pub struct MockDevice {
    params: DeviceParams,
    link: Mutex<LinkState>,
    pause: AtomicU32,
    script: Mutex<VecDeque<Result<(), EncapError>>>,
    credits: Mutex<Vec<u32>>,
    rx: Mutex<Vec<VecDeque<MockRx>>>,
    calls: Mutex<Calls>,
}

impl MockDevice {
    pub fn new(params: DeviceParams) -> Arc<Self> {
        let n = usize::from(params.nqsets);
        Arc::new(MockDevice {
            params,
            link: Mutex::new(LinkState::Up),
            pause: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            credits: Mutex::new(vec![0; n]),
            rx: Mutex::new(vec![VecDeque::new(); n]),
            calls: Mutex::new(Calls::default()),
        })
    }

    /// Outcomes of the next `txd_encap` calls; later calls succeed.
    pub fn script_encap(&self, outcomes: impl IntoIterator<Item = Result<(), EncapError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Reports `n` more descriptors of queue `qid` as done.
    pub fn complete(&self, qid: u16, n: u32) {
        self.credits.lock().unwrap()[usize::from(qid)] += n;
    }

    pub fn push_rx(&self, qid: u16, rx: MockRx) {
        self.rx.lock().unwrap()[usize::from(qid)].push_back(rx);
    }

    pub fn set_link(&self, state: LinkState) {
        *self.link.lock().unwrap() = state;
    }

    pub fn set_pause_frames(&self, n: u32) {
        self.pause.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }
}

impl Device for MockDevice {
    fn params(&self) -> DeviceParams {
        self.params
    }

    fn txd_encap(&self, pi: &PktInfo<'_>) -> Result<Encapped, EncapError> {
        self.calls().encaps.push(EncapCall {
            qid: pi.qsidx,
            pidx: pi.pidx,
            nsegs: pi.segs.len(),
            len: pi.len,
        });
        if let Some(Err(e)) = self.script.lock().unwrap().pop_front() {
            return Err(e);
        }
        let n = pi.segs.len() as u32;
        Ok(Encapped {
            new_pidx: (pi.pidx + n) % self.params.ntxd,
            ndescs: n,
        })
    }

    fn txd_flush(&self, qid: u16, pidx: u32) {
        self.calls().tx_flushes.push((qid, pidx));
    }

    fn txd_credits_update(&self, qid: u16, _cidx: u32, clear: bool) -> u32 {
        let mut credits = self.credits.lock().unwrap();
        let n = credits[usize::from(qid)];
        if clear {
            credits[usize::from(qid)] = 0;
        }
        n
    }

    fn rxd_available(&self, qid: u16, _cidx: u32) -> u32 {
        self.rx.lock().unwrap()[usize::from(qid)].len() as u32
    }

    fn rxd_pkt_get(&self, ri: &mut RxdInfo) -> Result<(), DeviceError> {
        let rx = self.rx.lock().unwrap()[usize::from(ri.qsidx)]
            .pop_front()
            .ok_or(DeviceError::NoPacket)?;
        ri.len = rx.frags.iter().map(|f| f.len).sum();
        ri.pad = rx.pad;
        ri.frags = rx.frags;
        Ok(())
    }

    fn rxd_refill(&self, qid: u16, flid: u8, pidx: u32, addrs: &[u64]) {
        self.calls().refills.push((qid, flid, pidx, addrs.len()));
    }

    fn rxd_flush(&self, qid: u16, flid: u8, pidx: u32) {
        self.calls().rx_flushes.push((qid, flid, pidx));
    }

    fn update_admin_status(&self) -> LinkState {
        *self.link.lock().unwrap()
    }

    fn init(&self) {
        self.credits.lock().unwrap().fill(0);
        self.calls().inits += 1;
    }

    fn stop(&self) {
        self.calls().stops += 1;
    }

    fn detach(&self) {
        self.calls().detaches += 1;
    }

    fn queue_intr_enable(&self, _qid: u16) {
        self.calls().queue_intr_enables += 1;
    }

    fn watchdog_reset(&self) {
        self.calls().watchdog_resets += 1;
    }

    fn pause_frames(&self) -> u32 {
        self.pause.load(Ordering::SeqCst)
    }
}

struct PoolState {
    outstanding: AtomicUsize,
    budget: Mutex<Option<usize>>,
    max: usize,
}

impl Recycle for PoolState {
    fn recycle(&self, _data: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Heap pool that counts outstanding buffers and can run dry on request.
pub struct MockPool {
    state: Arc<PoolState>,
}

impl MockPool {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(MockPool {
            state: Arc::new(PoolState {
                outstanding: AtomicUsize::new(0),
                budget: Mutex::new(None),
                max,
            }),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Allow `n` more allocations, or any number with `None`.
    pub fn set_budget(&self, n: Option<usize>) {
        *self.state.budget.lock().unwrap() = n;
    }

    /// A packet of full segments of the given lengths.
    pub fn packet(&self, lens: &[usize]) -> Packet {
        Packet::from_segments(
            lens.iter()
                .map(|&len| Segment::full(self.alloc(len).unwrap()))
                .collect(),
        )
    }

    /// A packet whose segments sit at the start of `cap`-byte buffers.
    pub fn packet_with_room(&self, cap: usize, lens: &[usize]) -> Packet {
        Packet::from_segments(
            lens.iter()
                .map(|&len| Segment::new(self.alloc(cap).unwrap(), 0, len))
                .collect(),
        )
    }
}

impl BufferPool for MockPool {
    fn alloc(&self, size: usize) -> Option<Buffer> {
        if size > self.state.max {
            return None;
        }
        if let Some(left) = self.state.budget.lock().unwrap().as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(Buffer::pooled(
            vec![0; size].into_boxed_slice(),
            self.state.clone(),
        ))
    }

    fn max_buf_size(&self) -> usize {
        self.state.max
    }
}

#[derive(Default)]
pub struct MockMapper {
    next: AtomicU64,
    active: AtomicUsize,
    /// Outcomes of the next `map` calls; `None` maps normally.
    script: Mutex<VecDeque<Option<MapError>>>,
}

impl MockMapper {
    pub fn new() -> Arc<Self> {
        Arc::new(MockMapper {
            next: AtomicU64::new(0x10_0000),
            ..MockMapper::default()
        })
    }

    /// Lets `n` mappings succeed, then fails one with `err`.
    pub fn fail_after(&self, n: usize, err: MapError) {
        let mut script = self.script.lock().unwrap();
        script.extend(std::iter::repeat_n(None, n));
        script.push_back(Some(err));
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl DmaMapper for MockMapper {
    fn map(&self, frags: &[&[u8]], max_segs: usize) -> Result<Mapping, MapError> {
        if let Some(Some(e)) = self.script.lock().unwrap().pop_front() {
            return Err(e);
        }
        if frags.len() > max_segs {
            return Err(MapError::TooManySegments);
        }
        let segs = frags
            .iter()
            .map(|f| DmaSeg {
                addr: self.next.fetch_add(0x1000, Ordering::SeqCst),
                len: f.len() as u32,
            })
            .collect();
        let token = self.active.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(Mapping::new(segs, token))
    }

    fn unmap(&self, _mapping: Mapping) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingStack {
    pub delivered: Mutex<Vec<(u16, Vec<u8>)>>,
    pub links: Mutex<Vec<LinkState>>,
    pub hung: Mutex<Vec<u16>>,
}

impl Stack for RecordingStack {
    fn deliver(&self, qid: u16, pkt: Packet) {
        self.delivered.lock().unwrap().push((qid, pkt.to_vec()));
    }

    fn link_state_changed(&self, state: LinkState) {
        self.links.lock().unwrap().push(state);
    }

    fn queue_hung(&self, qid: u16) {
        self.hung.lock().unwrap().push(qid);
    }
}

/// Mocks wired into a `Shared` without a runtime, running with link up.
pub struct Harness {
    pub dev: Arc<MockDevice>,
    pub pool: Arc<MockPool>,
    pub mapper: Arc<MockMapper>,
    pub shared: Arc<Shared>,
}

impl Harness {
    pub fn new(params: DeviceParams, cfg: EngineConfig) -> Self {
        let dev = MockDevice::new(params);
        let pool = MockPool::new(4096);
        let mapper = MockMapper::new();
        let tun = Tunables::resolve(&cfg, &params).unwrap();
        let shared = Arc::new(Shared::new(
            dev.clone(),
            pool.clone(),
            mapper.clone(),
            Arc::new(RecordingStack::default()),
            params,
            tun,
            None,
        ));
        shared.set_running(true);
        shared.set_link(LinkState::Up);
        Harness {
            dev,
            pool,
            mapper,
            shared,
        }
    }
}
