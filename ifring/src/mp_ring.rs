//! # Multi-Producer Submission Ring
//!
//! ## Purpose
//!
//! Bounded queue between any number of submitting threads and the single TX
//! drain routine of a queue. Producers never take a lock; the drain routine
//! runs on whichever thread finds the ring idle, so at most one drain is in
//! progress at any time.
//!
//! ## How it works
//!
//! The whole ring state lives in one `AtomicU64`: producer head (reserved),
//! producer tail (published), consumer index and a flags field. A producer
//! reserves space by advancing the head with a CAS, waits until every earlier
//! reservation is published, writes its items and publishes by advancing the
//! tail. Publishing also claims the consumer role: if the ring was not `Busy`
//! the producer drains inline (or, when abdicating, only marks the ring
//! `Abdicated` and leaves the work to a deferred task).
//!
//! A drain that makes no progress parks the ring in `Stalled`; it is restarted
//! by the next producer or by `check_drainage` once the consumer reports it can
//! progress again.
//!
//! ## Main components
//!
//! - `MpRing`: the ring.
//! - `Consumer`: implemented by the drain routine.
//! - `Items`: the window of published entries handed to a drain call.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

const IDLE: u16 = 0;
const BUSY: u16 = 1;
const STALLED: u16 = 2;
const ABDICATED: u16 = 3;

/// Entries drained before the consumer index is published.
const PUBLISH_BATCH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingState {
    #[default]
    Idle,
    Busy,
    Stalled,
    Abdicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    pidx_head: u16,
    pidx_tail: u16,
    cidx: u16,
    flags: u16,
}

impl State {
    fn unpack(v: u64) -> Self {
        State {
            pidx_head: v as u16,
            pidx_tail: (v >> 16) as u16,
            cidx: (v >> 32) as u16,
            flags: (v >> 48) as u16,
        }
    }

    fn pack(self) -> u64 {
        u64::from(self.pidx_head)
            | u64::from(self.pidx_tail) << 16
            | u64::from(self.cidx) << 32
            | u64::from(self.flags) << 48
    }
}

/// The drain side of a ring.
pub trait Consumer<T> {
    /// Consumes a prefix of `items` and returns its length. Every consumed
    /// entry must have been taken; every other entry must be left in place.
    fn drain(&self, items: Items<'_, T>) -> u32;

    /// Whether a stalled ring is worth restarting.
    fn can_drain(&self) -> bool;
}

/// Published entries from the consumer index onward.
pub struct Items<'a, T> {
    ring: &'a MpRing<T>,
    cidx: u16,
    len: u32,
}

impl<T> Items<'_, T> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry at `offset` from the consumer index.
    pub fn slot(&mut self, offset: u32) -> &mut Option<T> {
        assert!(offset < self.len, "offset {offset} outside drain window");
        let idx = self.ring.increment(self.cidx, offset as u16);
        // SAFETY: entries between cidx and the published tail belong to the
        // single active consumer, and `&mut self` prevents aliasing.
        unsafe { &mut *self.ring.items[idx as usize].get() }
    }

    pub fn take(&mut self, offset: u32) -> Option<T> {
        self.slot(offset).take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub state: RingState,
    /// Entries published but not yet consumed.
    pub pending: u32,
    pub enqueues: u64,
    pub drops: u64,
    pub starts: u64,
    pub stalls: u64,
    pub restarts: u64,
    pub abdications: u64,
}

#[derive(Default)]
struct Counters {
    enqueues: AtomicU64,
    drops: AtomicU64,
    starts: AtomicU64,
    stalls: AtomicU64,
    restarts: AtomicU64,
    abdications: AtomicU64,
}

fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

pub struct MpRing<T> {
    state: AtomicU64,
    size: u16,
    items: Box<[UnsafeCell<Option<T>>]>,
    counters: Counters,
}

// SAFETY: entries are only touched by the producer that reserved them or by
// the single consumer, with the state word ordering the hand-offs.
unsafe impl<T: Send> Send for MpRing<T> {}
unsafe impl<T: Send> Sync for MpRing<T> {}

impl<T> MpRing<T> {
    /// Creates a ring of `size` entries, `size - 1` of them usable.
    ///
    /// # Panics
    /// If `size` is not a power of two in `2..=32768`.
    pub fn new(size: usize) -> Self {
        assert!(
            size.is_power_of_two() && (2..=32768).contains(&size),
            "ring size {size} must be a power of two in 2..=32768"
        );
        MpRing {
            state: AtomicU64::new(0),
            size: size as u16,
            items: (0..size).map(|_| UnsafeCell::new(None)).collect(),
            counters: Counters::default(),
        }
    }

    /// Usable entries.
    pub fn capacity(&self) -> usize {
        self.size as usize - 1
    }

    fn load(&self) -> State {
        State::unpack(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, old: State, new: State) -> Result<(), State> {
        self.state
            .compare_exchange_weak(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::unpack)
    }

    fn increment(&self, idx: u16, n: u16) -> u16 {
        idx.wrapping_add(n) & (self.size - 1)
    }

    fn distance(&self, head: u16, tail: u16) -> u32 {
        u32::from(head.wrapping_sub(tail) & (self.size - 1))
    }

    fn space_available(&self, s: State) -> u32 {
        self.capacity() as u32 - self.distance(s.pidx_head, s.cidx)
    }

    fn state_to_flags(s: State, abdicate: bool) -> u16 {
        if s.cidx == s.pidx_tail {
            IDLE
        } else if abdicate && s.pidx_tail != s.pidx_head {
            ABDICATED
        } else {
            BUSY
        }
    }

    /// Adds a batch of items.
    ///
    /// # Arguments
    /// * `items` - The batch; accepted entirely or not at all.
    /// * `budget` - Entries an inline drain processes before it may hand off.
    /// * `abdicate` - Leave draining to the caller's deferred task.
    /// * `consumer` - The drain routine.
    ///
    /// # Errors
    /// Hands the batch back when it does not fit.
    pub fn enqueue<C: Consumer<T>>(
        &self,
        items: Vec<T>,
        budget: u32,
        abdicate: bool,
        consumer: &C,
    ) -> Result<(), Vec<T>> {
        let n = items.len();
        if n == 0 {
            return Ok(());
        }
        let mut os = self.load();
        let reserved = loop {
            if n as u64 > u64::from(self.space_available(os)) {
                bump(&self.counters.drops, n as u64);
                if os.flags == STALLED {
                    self.check_drainage(0, consumer);
                }
                return Err(items);
            }
            let mut ns = os;
            ns.pidx_head = self.increment(os.pidx_head, n as u16);
            match self.cas(os, ns) {
                Ok(()) => break ns,
                Err(cur) => {
                    os = cur;
                    hint::spin_loop();
                }
            }
        };
        let pidx_start = os.pidx_head;
        let pidx_stop = reserved.pidx_head;

        // earlier reservations publish first
        while self.load().pidx_tail != pidx_start {
            hint::spin_loop();
        }

        let mut idx = pidx_start;
        for item in items {
            // SAFETY: [pidx_start, pidx_stop) is reserved by this producer and
            // the consumer cannot reach it before the tail moves.
            unsafe { *self.items[idx as usize].get() = Some(item) };
            idx = self.increment(idx, 1);
        }
        debug_assert_eq!(idx, pidx_stop);

        let mut os = self.load();
        let published = loop {
            let mut ns = os;
            ns.pidx_tail = pidx_stop;
            if abdicate {
                if os.flags == IDLE {
                    ns.flags = ABDICATED;
                }
            } else {
                ns.flags = BUSY;
            }
            match self.cas(os, ns) {
                Ok(()) => break ns,
                Err(cur) => os = cur,
            }
        };
        bump(&self.counters.enqueues, n as u64);

        if !abdicate && os.flags != BUSY {
            self.drain_lockless(published, os.flags, budget, consumer);
        }
        Ok(())
    }

    /// Restarts a stalled or abdicated ring.
    pub fn check_drainage<C: Consumer<T>>(&self, budget: u32, consumer: &C) {
        let os = self.load();
        if os.flags != STALLED && os.flags != ABDICATED {
            return;
        }
        if os.pidx_head != os.pidx_tail {
            return;
        }
        if os.flags != ABDICATED && !consumer.can_drain() {
            return;
        }
        debug_assert_ne!(os.cidx, os.pidx_tail);
        let mut ns = os;
        ns.flags = BUSY;
        if self.cas(os, ns).is_err() {
            return;
        }
        self.drain_lockless(ns, os.flags, budget, consumer);
    }

    fn drain_lockless<C: Consumer<T>>(&self, os: State, prev: u16, budget: u32, consumer: &C) {
        debug_assert_eq!(os.flags, BUSY);
        let mut cidx = os.cidx;
        let mut pidx = os.pidx_tail;
        if prev == IDLE {
            bump(&self.counters.starts, 1);
        }
        let mut pending = 0u32;
        let mut total = 0u32;

        while cidx != pidx {
            let len = self.distance(pidx, cidx);
            let n = consumer.drain(Items {
                ring: self,
                cidx,
                len,
            });
            assert!(n <= len, "consumer took {n} of {len} entries");
            if n == 0 {
                let mut cur = self.load();
                loop {
                    let mut ns = cur;
                    ns.cidx = cidx;
                    ns.flags = STALLED;
                    match self.cas(cur, ns) {
                        Ok(()) => break,
                        Err(c) => cur = c,
                    }
                }
                if prev != STALLED {
                    bump(&self.counters.stalls, 1);
                } else if total > 0 {
                    bump(&self.counters.restarts, 1);
                    bump(&self.counters.stalls, 1);
                }
                break;
            }
            cidx = self.increment(cidx, n as u16);
            pending += n;
            total += n;

            if cidx != pidx && pending < PUBLISH_BATCH && total < budget {
                continue;
            }

            let mut cur = self.load();
            let ns = loop {
                let mut ns = cur;
                ns.cidx = cidx;
                ns.flags = Self::state_to_flags(ns, total >= budget);
                match self.cas(cur, ns) {
                    Ok(()) => break ns,
                    Err(c) => cur = c,
                }
            };
            if ns.flags == ABDICATED {
                bump(&self.counters.abdications, 1);
            }
            if ns.flags != BUSY {
                if prev == STALLED {
                    bump(&self.counters.restarts, 1);
                }
                break;
            }
            pidx = ns.pidx_tail;
            pending = 0;
        }
    }

    pub fn state(&self) -> RingState {
        match self.load().flags {
            IDLE => RingState::Idle,
            BUSY => RingState::Busy,
            STALLED => RingState::Stalled,
            _ => RingState::Abdicated,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == RingState::Idle
    }

    pub fn is_stalled(&self) -> bool {
        self.state() == RingState::Stalled
    }

    /// Entries published but not consumed.
    pub fn pending(&self) -> u32 {
        let s = self.load();
        self.distance(s.pidx_tail, s.cidx)
    }

    pub fn stats(&self) -> RingStats {
        let c = &self.counters;
        RingStats {
            state: self.state(),
            pending: self.pending(),
            enqueues: c.enqueues.load(Ordering::Relaxed),
            drops: c.drops.load(Ordering::Relaxed),
            starts: c.starts.load(Ordering::Relaxed),
            stalls: c.stalls.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
            abdications: c.abdications.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.enqueues,
            &c.drops,
            &c.starts,
            &c.stalls,
            &c.restarts,
            &c.abdications,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Takes up to `limit` entries per call and records them.
    struct Sink {
        limit: AtomicU32,
        seen: Mutex<Vec<u32>>,
        can: AtomicBool,
    }

    impl Sink {
        fn new(limit: u32) -> Self {
            Sink {
                limit: AtomicU32::new(limit),
                seen: Mutex::new(Vec::new()),
                can: AtomicBool::new(true),
            }
        }
    }

    impl Consumer<u32> for Sink {
        fn drain(&self, mut items: Items<'_, u32>) -> u32 {
            let n = items.len().min(self.limit.load(Ordering::Relaxed));
            let mut seen = self.seen.lock().unwrap();
            for i in 0..n {
                seen.push(items.take(i).unwrap());
            }
            n
        }

        fn can_drain(&self) -> bool {
            self.can.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn exact_capacity_is_accepted() {
        let ring: MpRing<u32> = MpRing::new(8);
        let sink = Sink::new(0);
        assert!(ring.enqueue((0..7).collect(), 64, false, &sink).is_ok());
        assert_eq!(ring.pending(), 7);
        assert_eq!(ring.state(), RingState::Stalled);
    }

    #[test]
    fn overflow_is_rejected_whole() {
        let ring: MpRing<u32> = MpRing::new(8);
        let sink = Sink::new(0);
        ring.enqueue(vec![1, 2, 3], 64, false, &sink).unwrap();
        let back = ring.enqueue((10..15).collect(), 64, false, &sink).unwrap_err();
        assert_eq!(back, vec![10, 11, 12, 13, 14]);
        assert_eq!(ring.pending(), 3);
        assert_eq!(ring.stats().drops, 5);
    }

    #[test]
    fn inline_drain_goes_idle() {
        let ring: MpRing<u32> = MpRing::new(16);
        let sink = Sink::new(u32::MAX);
        ring.enqueue(vec![1, 2, 3], 64, false, &sink).unwrap();
        ring.enqueue(vec![4], 64, false, &sink).unwrap();
        assert!(ring.is_idle());
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(ring.stats().starts, 2);
    }

    #[test]
    fn stalled_ring_restarts_when_consumer_can_progress() {
        let ring: MpRing<u32> = MpRing::new(16);
        let sink = Sink::new(0);
        ring.enqueue(vec![1, 2], 64, false, &sink).unwrap();
        assert!(ring.is_stalled());

        sink.can.store(false, Ordering::Relaxed);
        sink.limit.store(u32::MAX, Ordering::Relaxed);
        ring.check_drainage(64, &sink);
        assert!(ring.is_stalled());

        sink.can.store(true, Ordering::Relaxed);
        ring.check_drainage(64, &sink);
        assert!(ring.is_idle());
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(ring.stats().restarts, 1);
    }

    #[test]
    fn abdication_defers_the_drain() {
        let ring: MpRing<u32> = MpRing::new(16);
        let sink = Sink::new(u32::MAX);
        ring.enqueue(vec![1, 2], 64, true, &sink).unwrap();
        assert_eq!(ring.state(), RingState::Abdicated);
        assert!(sink.seen.lock().unwrap().is_empty());
        ring.check_drainage(64, &sink);
        assert!(ring.is_idle());
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn partial_consumption_keeps_order() {
        let ring: MpRing<u32> = MpRing::new(16);
        let sink = Sink::new(1);
        ring.enqueue(vec![1, 2, 3], 64, false, &sink).unwrap();
        assert!(ring.is_idle());
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn many_producers_one_consumer() {
        const PRODUCERS: u32 = 4;
        const PER: u32 = 5000;
        let ring = Arc::new(MpRing::new(256));
        let sink = Arc::new(Sink::new(u32::MAX));
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                let sink = sink.clone();
                thread::spawn(move || {
                    for i in 0..PER {
                        let mut v = vec![p << 24 | i];
                        while let Err(back) = ring.enqueue(v, 64, false, &*sink) {
                            v = back;
                            ring.check_drainage(64, &*sink);
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        while !ring.is_idle() {
            ring.check_drainage(u32::MAX, &*sink);
            thread::yield_now();
        }
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len() as u32, PRODUCERS * PER);
        for p in 0..PRODUCERS {
            let mine: Vec<u32> = seen
                .iter()
                .filter(|v| *v >> 24 == p)
                .map(|v| v & 0xff_ffff)
                .collect();
            assert_eq!(mine, (0..PER).collect::<Vec<_>>(), "producer {p} reordered");
        }
    }
}
