//! # Context
//!
//! ## Purpose
//!
//! The orchestrator. A `Context` owns every queue pair of one device, the
//! deferred work units that service them, the per-queue watchdog timers and the
//! aggregate link state. It is the surface the upstream stack talks to.
//!
//! ## How it works
//!
//! `attach` validates the device's parameters, builds the queues and spawns one
//! TX task and one RX task per queue plus an admin task on the current tokio
//! runtime. Interrupts arrive through [`Interrupts`] and only enqueue those
//! tasks. `init` brings the device up: buffers are posted, the interface is
//! marked running and the watchdog timers start. Each timer tick checks its
//! queue for a hang; a hung queue reinitialises the whole device once.
//!
//! Teardown goes in a fixed order: close the queues, stop timers, flush the
//! submission rings, reclaim and release buffers, destroy mappings, then cancel
//! and await the tasks.
//!
//! ## Main components
//!
//! - `Context`: the owning handle.
//! - `Stack`: upcalls into the network stack.
//! - `Interrupts`: a cloneable, weak handle for interrupt sources.
//! - `ContextStats`: counters snapshot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::Services;
use crate::buf::{BufferPool, Packet};
use crate::config::{EngineConfig, LRO_ENTRIES, RESTART_BUDGET, Tunables};
use crate::device::{Device, DeviceParams, LinkState};
use crate::dma::DmaMapper;
use crate::error::{EngineError, SubmitError};
use crate::free_list::FreeList;
use crate::lro::Lro;
use crate::parse::{MAX_HDR_LEN, flow_hash};
use crate::rxq::{RxQueue, RxQueueStats};
use crate::taskq::GroupTask;
use crate::txq::{QueueState, TxQueue, TxQueueStats};

/// Upcalls into the network stack.
pub trait Stack: Send + Sync {
    /// A received packet, in arrival order per queue.
    fn deliver(&self, qid: u16, pkt: Packet);

    fn link_state_changed(&self, _state: LinkState) {}

    /// Queue `qid` stopped completing work and the device is being reset.
    fn queue_hung(&self, _qid: u16) {}
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DrvFlags: u32 {
        const RUNNING = 1 << 0;
        /// Transmit is blocked while the device is being stopped.
        const OACTIVE = 1 << 1;
        /// Drains drop whatever they find.
        const QFLUSH = 1 << 2;
    }
}

fn link_from_u8(v: u8) -> LinkState {
    match v {
        1 => LinkState::Down,
        2 => LinkState::Up,
        _ => LinkState::Unknown,
    }
}

fn link_to_u8(state: LinkState) -> u8 {
    match state {
        LinkState::Unknown => 0,
        LinkState::Down => 1,
        LinkState::Up => 2,
    }
}

/// State every queue of a context reads.
pub(crate) struct Shared {
    pub dev: Arc<dyn Device>,
    pub pool: Arc<dyn BufferPool>,
    pub mapper: Arc<dyn DmaMapper>,
    pub stack: Arc<dyn Stack>,
    pub params: DeviceParams,
    pub tun: Tunables,
    flags: AtomicU32,
    link: AtomicU8,
    runtime: Option<Handle>,
    tracker: TaskTracker,
    root: CancellationToken,
    /// Cancels the timers of the current init cycle.
    timers: Mutex<CancellationToken>,
}

impl Shared {
    pub fn new(
        dev: Arc<dyn Device>,
        pool: Arc<dyn BufferPool>,
        mapper: Arc<dyn DmaMapper>,
        stack: Arc<dyn Stack>,
        params: DeviceParams,
        tun: Tunables,
        runtime: Option<Handle>,
    ) -> Self {
        let root = CancellationToken::new();
        Shared {
            dev,
            pool,
            mapper,
            stack,
            params,
            tun,
            flags: AtomicU32::new(0),
            link: AtomicU8::new(link_to_u8(LinkState::Unknown)),
            runtime,
            tracker: TaskTracker::new(),
            timers: Mutex::new(root.child_token()),
            root,
        }
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            dev: &*self.dev,
            pool: &*self.pool,
            mapper: &*self.mapper,
        }
    }

    fn flags(&self) -> DrvFlags {
        DrvFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, f: DrvFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, f: DrvFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    pub fn is_running(&self) -> bool {
        self.flags().contains(DrvFlags::RUNNING)
    }

    pub fn set_running(&self, running: bool) {
        if running {
            self.set_flags(DrvFlags::RUNNING);
            self.clear_flags(DrvFlags::OACTIVE);
        } else {
            self.set_flags(DrvFlags::OACTIVE);
            self.clear_flags(DrvFlags::RUNNING);
        }
    }

    pub fn is_oactive(&self) -> bool {
        self.flags().contains(DrvFlags::OACTIVE)
    }

    pub fn is_flushing(&self) -> bool {
        self.flags().contains(DrvFlags::QFLUSH)
    }

    pub fn link(&self) -> LinkState {
        link_from_u8(self.link.load(Ordering::Acquire))
    }

    /// Stores `state` and returns the previous one.
    pub fn set_link(&self, state: LinkState) -> LinkState {
        link_from_u8(self.link.swap(link_to_u8(state), Ordering::AcqRel))
    }

    pub fn link_up(&self) -> bool {
        self.link() == LinkState::Up
    }

    /// Spawns `fut` on the context's runtime.
    ///
    /// # Returns
    /// `false` if the context has no runtime.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(handle) => {
                self.tracker.spawn_on(fut, handle);
                true
            }
            None => false,
        }
    }

    pub fn attach_task<F>(&self, task: &Arc<GroupTask>, body: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(handle) = &self.runtime {
            task.attach(handle, &self.tracker, self.root.child_token(), body);
        }
    }

    /// Token of the running timers.
    pub fn timer_token(&self) -> CancellationToken {
        crate::lock(&self.timers).clone()
    }

    /// Cancels the running timers and returns a fresh token for new ones.
    fn restart_timers(&self) -> CancellationToken {
        let mut timers = crate::lock(&self.timers);
        timers.cancel();
        *timers = self.root.child_token();
        timers.clone()
    }

    fn stop_timers(&self) {
        crate::lock(&self.timers).cancel();
    }
}

/// A snapshot of every counter of a context.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub link: LinkState,
    pub running: bool,
    /// Device resets triggered by hung queues.
    pub watchdog_events: u64,
    pub tx: Vec<TxQueueStats>,
    pub rx: Vec<RxQueueStats>,
}

struct CtxInner {
    me: Weak<CtxInner>,
    shared: Arc<Shared>,
    txqs: Vec<Arc<TxQueue>>,
    rxqs: Vec<Mutex<RxQueue>>,
    rx_tasks: Vec<Arc<GroupTask>>,
    admin_task: Arc<GroupTask>,
    /// Serialises init, stop, link updates and watchdog resets.
    admin: Mutex<()>,
    watchdog_events: AtomicU64,
    detached: AtomicBool,
}

/// A device driven by the engine.
pub struct Context {
    inner: Arc<CtxInner>,
}

/// Interrupt entry points. Each call only schedules deferred work; calls after
/// the context is gone are ignored.
#[derive(Clone)]
pub struct Interrupts {
    inner: Weak<CtxInner>,
}

impl Interrupts {
    /// TX completions on queue `qid`.
    pub fn tx(&self, qid: u16) {
        if let Some(ctx) = self.inner.upgrade() {
            if let Some(txq) = ctx.txqs.get(usize::from(qid)) {
                txq.task().enqueue();
            }
        }
    }

    /// RX completions on queue `qid`.
    pub fn rx(&self, qid: u16) {
        if let Some(ctx) = self.inner.upgrade() {
            if let Some(task) = ctx.rx_tasks.get(usize::from(qid)) {
                task.enqueue();
            }
        }
    }

    /// Link or other admin event.
    pub fn admin(&self) {
        if let Some(ctx) = self.inner.upgrade() {
            ctx.admin_task.enqueue();
        }
    }
}

impl Context {
    /// Builds the queues of `dev` and spawns their tasks on the current tokio
    /// runtime. The device stays stopped until [`Context::init`].
    ///
    /// # Errors
    /// `NoRuntime` outside a tokio runtime, `InvalidParams`/`InvalidConfig`
    /// when the device parameters or `cfg` are unusable.
    pub fn attach(
        dev: Arc<dyn Device>,
        pool: Arc<dyn BufferPool>,
        mapper: Arc<dyn DmaMapper>,
        stack: Arc<dyn Stack>,
        cfg: EngineConfig,
    ) -> Result<Context, EngineError> {
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let params = dev.params();
        params.validate()?;
        let tun = Tunables::resolve(&cfg, &params)?;
        let buf_size = params.rx_buf_size();
        if buf_size > pool.max_buf_size() {
            return Err(EngineError::InvalidParams(format!(
                "receive buffers of {buf_size} bytes exceed the pool's {}",
                pool.max_buf_size()
            )));
        }
        let shared = Arc::new(Shared::new(dev, pool, mapper, stack, params, tun, Some(handle)));

        let txqs = (0..params.nqsets)
            .map(|q| TxQueue::new(q, shared.clone()))
            .collect();
        let rxqs = (0..params.nqsets)
            .map(|q| {
                let fls = (0..params.nfl)
                    .map(|fl| FreeList::new(q, fl, params.nrxd, buf_size, tun.rx_refill_batch))
                    .collect();
                let cq = params.has_cq.then_some(params.nrxd);
                let lro = tun.lro.then(|| Lro::new(LRO_ENTRIES));
                Mutex::new(RxQueue::new(q, fls, cq, lro))
            })
            .collect();
        let rx_tasks = (0..params.nqsets)
            .map(|q| GroupTask::new(format!("rxq{q}")))
            .collect();

        let inner = Arc::new_cyclic(|me| CtxInner {
            me: me.clone(),
            shared,
            txqs,
            rxqs,
            rx_tasks,
            admin_task: GroupTask::new("admin"),
            admin: Mutex::new(()),
            watchdog_events: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });
        inner.attach_tasks();
        log::info!(
            "attached {} queue pairs, {} TX / {} RX descriptors, {} byte buffers",
            params.nqsets,
            params.ntxd,
            params.nrxd,
            buf_size
        );
        Ok(Context { inner })
    }

    /// (Re)initialises the device and starts the queues.
    pub fn init(&self) {
        let _guard = crate::lock(&self.inner.admin);
        self.inner.stop_locked();
        self.inner.init_locked();
    }

    /// Stops the device and releases every buffer it holds.
    pub fn stop(&self) {
        let _guard = crate::lock(&self.inner.admin);
        self.inner.stop_locked();
    }

    /// Queues a batch for transmission on the queue its first packet hashes to.
    ///
    /// # Errors
    /// Hands the batch back on `Full`, `NotRunning` or `Closed`.
    pub fn submit(&self, pkts: Vec<Packet>) -> Result<(), SubmitError> {
        let Some(first) = pkts.first() else {
            return Ok(());
        };
        if !self.inner.shared.is_running() {
            return Err(SubmitError::NotRunning(pkts));
        }
        let q = self.inner.select_queue(first);
        self.inner.txqs[q].transmit(pkts)
    }

    /// Drops every queued submission on every queue.
    pub fn qflush(&self) {
        self.inner.qflush();
    }

    pub fn interrupts(&self) -> Interrupts {
        Interrupts {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Applies a link transition reported by the device.
    pub fn link_state_change(&self, state: LinkState) {
        self.inner.link_state_change(state);
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.shared.link()
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.is_running()
    }

    pub fn nqsets(&self) -> u16 {
        self.inner.shared.params.nqsets
    }

    pub fn queue_state(&self, qid: u16) -> Option<QueueState> {
        self.inner.txqs.get(usize::from(qid)).map(|t| t.state())
    }

    pub fn stats(&self) -> ContextStats {
        let inner = &self.inner;
        ContextStats {
            link: inner.shared.link(),
            running: inner.shared.is_running(),
            watchdog_events: inner.watchdog_events.load(Ordering::Relaxed),
            tx: inner.txqs.iter().map(|t| t.stats()).collect(),
            rx: inner.rxqs.iter().map(|r| crate::lock(r).stats()).collect(),
        }
    }

    /// Tears the device down and waits for every task to finish.
    pub async fn detach(self) {
        self.inner.detached.store(true, Ordering::Release);
        self.inner.shutdown();
        self.inner.shared.tracker.wait().await;
        self.inner.shared.dev.detach();
        log::info!("detached");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.inner.detached.swap(true, Ordering::AcqRel) {
            self.inner.shutdown();
            self.inner.shared.dev.detach();
        }
    }
}

impl CtxInner {
    fn attach_tasks(&self) {
        let sh = &self.shared;
        for txq in &self.txqs {
            let me = self.me.clone();
            let qid = txq.id();
            sh.attach_task(txq.task(), move || {
                if let Some(ctx) = me.upgrade() {
                    ctx.tx_task(qid);
                }
            });
        }
        for (q, task) in self.rx_tasks.iter().enumerate() {
            let me = self.me.clone();
            let qid = q as u16;
            sh.attach_task(task, move || {
                if let Some(ctx) = me.upgrade() {
                    ctx.rx_task(qid);
                }
            });
        }
        let me = self.me.clone();
        sh.attach_task(&self.admin_task, move || {
            if let Some(ctx) = me.upgrade() {
                ctx.admin_task();
            }
        });
    }

    fn select_queue(&self, pkt: &Packet) -> usize {
        let n = self.txqs.len();
        if n == 1 {
            return 0;
        }
        pkt.meta
            .flowid
            .or_else(|| flow_hash(&pkt.copy_head(MAX_HDR_LEN)))
            .map_or(0, |h| h as usize % n)
    }

    fn init_locked(&self) {
        let sh = &*self.shared;
        sh.stop_timers();
        sh.dev.intr_disable();
        sh.dev.init();
        let svc = sh.services();
        for rxq in &self.rxqs {
            crate::lock(rxq).setup(&svc, sh.tun.rx_initial_fill);
        }
        sh.set_running(true);
        sh.dev.intr_enable();
        for txq in &self.txqs {
            txq.start();
        }
        self.start_timers();
        self.admin_task.enqueue();
        log::debug!("device initialised");
    }

    fn stop_locked(&self) {
        let sh = &*self.shared;
        sh.set_running(false);
        sh.dev.intr_disable();
        sh.stop_timers();
        for txq in &self.txqs {
            txq.reclaim_all();
        }
        sh.dev.stop();
        let mut released = 0;
        for txq in &self.txqs {
            released += txq.stop();
        }
        for rxq in &self.rxqs {
            let mut rxq = crate::lock(rxq);
            released += rxq.stop(&*sh.mapper);
            rxq.reset_stats();
        }
        log::debug!("device stopped, released {released} buffers");
    }

    fn shutdown(&self) {
        for txq in &self.txqs {
            txq.close();
        }
        {
            let _guard = crate::lock(&self.admin);
            self.shared.clear_flags(DrvFlags::RUNNING);
            self.shared.stop_timers();
        }
        self.qflush();
        {
            let _guard = crate::lock(&self.admin);
            self.stop_locked();
        }
        self.shared.root.cancel();
        self.shared.tracker.close();
    }

    fn qflush(&self) {
        let _guard = crate::lock(&self.admin);
        self.shared.set_flags(DrvFlags::QFLUSH);
        for txq in &self.txqs {
            txq.flush();
        }
        self.shared.clear_flags(DrvFlags::QFLUSH);
    }

    fn start_timers(&self) {
        let token = self.shared.restart_timers();
        let period = self.shared.tun.watchdog_interval;
        for txq in &self.txqs {
            let me = self.me.clone();
            let qid = txq.id();
            let token = token.clone();
            self.shared.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    let Some(ctx) = me.upgrade() else { break };
                    ctx.txq_timer(qid);
                }
            });
        }
    }

    fn link_state_change(&self, state: LinkState) {
        let prev = self.shared.set_link(state);
        if prev == state {
            return;
        }
        log::info!("link {prev:?} -> {state:?}");
        self.shared.stack.link_state_changed(state);
        if state == LinkState::Up {
            for txq in &self.txqs {
                txq.task().enqueue();
            }
        }
    }

    fn tx_task(&self, qid: u16) {
        if !self.shared.is_running() {
            return;
        }
        self.txqs[usize::from(qid)].tx_task();
        self.shared.dev.queue_intr_enable(qid);
    }

    fn rx_task(&self, qid: u16) {
        let sh = &*self.shared;
        if !sh.is_running() {
            return;
        }
        let more = {
            let mut rxq = crate::lock(&self.rxqs[usize::from(qid)]);
            let stack = &*sh.stack;
            rxq.rxeof(
                &sh.services(),
                &|| sh.is_running(),
                &mut |pkt| stack.deliver(qid, pkt),
                sh.tun.rx_budget,
            )
        };
        if more {
            self.rx_tasks[usize::from(qid)].enqueue();
        } else {
            sh.dev.queue_intr_enable(qid);
        }
    }

    fn admin_task(&self) {
        let sh = &*self.shared;
        if !sh.is_running() {
            return;
        }
        {
            let _guard = crate::lock(&self.admin);
            sh.stop_timers();
            let link = sh.dev.update_admin_status();
            self.link_state_change(link);
            self.start_timers();
            sh.dev.link_intr_enable();
        }
        if !sh.link_up() {
            return;
        }
        for txq in &self.txqs {
            txq.check_drain(RESTART_BUDGET);
        }
    }

    /// One watchdog tick of queue `qid`.
    fn txq_timer(&self, qid: u16) {
        let sh = &*self.shared;
        if !sh.is_running() {
            return;
        }
        let txq = &self.txqs[usize::from(qid)];
        sh.dev.timer(qid);
        let pause = sh.dev.pause_frames();
        if txq.watchdog_check() == QueueState::Hung {
            if pause == 0 {
                self.watchdog_reset(txq);
                return;
            }
            log::debug!("txq {qid}: {pause} pause frames, not hung");
            txq.clear_hang();
        }
        if txq.needs_service() {
            txq.task().enqueue();
        }
    }

    fn watchdog_reset(&self, txq: &TxQueue) {
        let _guard = crate::lock(&self.admin);
        if !self.shared.is_running() {
            return;
        }
        let (avail, pidx) = txq.desc_info();
        log::warn!(
            "txq {}: watchdog timeout, {avail} descriptors available at pidx {pidx}, resetting",
            txq.id()
        );
        self.shared.dev.watchdog_reset();
        self.watchdog_events.fetch_add(1, Ordering::Relaxed);
        self.shared.stack.queue_hung(txq.id());
        self.stop_locked();
        self.init_locked();
    }
}
