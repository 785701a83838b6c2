//! # Engine Configuration
//!
//! ## Purpose
//!
//! Tunables that shape batching, doorbell coalescing, watchdog sensitivity and
//! receive behaviour. Every field is optional; `None` selects the default.
//!
//! ## How it works
//!
//! `EngineConfig` is what callers build. At attach it is resolved against the
//! device's `DeviceParams` into `Tunables`, which validates sizes that have to
//! be powers of two and caps values that would overrun a ring.

use std::time::Duration;

use crate::device::DeviceParams;
use crate::error::EngineError;

/// Packets the drain routine encodes per batch.
pub const TX_BATCH_SIZE: u32 = 32;
/// Drain budget used by the TX task.
pub const TX_BUDGET: u32 = 64;
/// Drain budget used when restarting queues after a link change.
pub const RESTART_BUDGET: u32 = 8;
/// Drain budget of the deferred doorbell callout.
pub const DOORBELL_RESTART_BUDGET: u32 = 4;
pub const RX_BUDGET: u32 = 64;
pub const RX_BUDGET_MAX: u32 = 1 << 16;
/// Extra buffers the receive path refills beyond its budget.
pub const RX_REFILL_SLACK: u32 = 8;
pub const RX_REFILL_BATCH: usize = 256;
pub const RX_INITIAL_FILL: u32 = 128;
pub const SUBMIT_RING_SIZE: usize = 2048;
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
pub const WATCHDOG_CHECKS: u32 = 3;
pub const LRO_ENTRIES: usize = 8;

/// When the TX doorbell is rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellPolicy {
    /// Ring at the end of every drain batch.
    Immediate,
    /// Ring when `threshold` descriptors are pending (a packet counts once
    /// per descriptor it occupies) or the hardware ring holds fewer than
    /// `min_occupancy` descriptors beyond one maximal packet; otherwise arm a
    /// one-shot callout of `delay`.
    Deferred {
        threshold: u32,
        min_occupancy: u32,
        delay: Duration,
    },
}

impl Default for DoorbellPolicy {
    fn default() -> Self {
        DoorbellPolicy::Deferred {
            threshold: 32,
            min_occupancy: 8,
            delay: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct EngineConfig {
    /// Entries of each submission ring, a power of two. Default 2048.
    pub submit_ring_size: Option<usize>,
    /// Packets encoded per drain batch. Default 32.
    pub tx_batch: Option<u32>,
    /// Drain budget of the TX task. Default 64.
    pub tx_budget: Option<u32>,
    /// Packets per RX task run. Default 64.
    pub rx_budget: Option<u32>,
    pub doorbell: Option<DoorbellPolicy>,
    /// Producers hand the drain to the TX task instead of draining inline.
    pub abdicate: Option<bool>,
    /// Coalesce same-flow TCP segments before delivery.
    pub lro: Option<bool>,
    /// Period of the TX watchdog. Default 500ms.
    pub watchdog_interval: Option<Duration>,
    /// Consecutive stalled checks before a queue is hung. Default 3.
    pub watchdog_checks: Option<u32>,
    /// Addresses per `rxd_refill` call. Default 256.
    pub rx_refill_batch: Option<usize>,
    /// Buffers posted per free list at init. Default 128.
    pub rx_initial_fill: Option<u32>,
}

/// Validated configuration in effect for one context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tunables {
    pub submit_ring_size: usize,
    pub tx_batch: u32,
    pub tx_budget: u32,
    pub rx_budget: u32,
    pub doorbell: DoorbellPolicy,
    pub abdicate: bool,
    pub lro: bool,
    pub watchdog_interval: Duration,
    pub watchdog_checks: u32,
    pub rx_refill_batch: usize,
    pub rx_initial_fill: u32,
}

impl Tunables {
    pub fn resolve(cfg: &EngineConfig, params: &DeviceParams) -> Result<Self, EngineError> {
        let fail = |msg: String| Err(EngineError::InvalidConfig(msg));
        let submit_ring_size = cfg.submit_ring_size.unwrap_or(SUBMIT_RING_SIZE);
        if !submit_ring_size.is_power_of_two() || !(2..=32768).contains(&submit_ring_size) {
            return fail(format!(
                "submit ring size {submit_ring_size} is not a power of two in 2..=32768"
            ));
        }
        let tx_batch = cfg.tx_batch.unwrap_or(TX_BATCH_SIZE);
        let tx_budget = cfg.tx_budget.unwrap_or(TX_BUDGET);
        let rx_budget = cfg.rx_budget.unwrap_or(RX_BUDGET);
        if tx_batch == 0 || tx_budget == 0 || rx_budget == 0 {
            return fail("batch and budgets must be positive".into());
        }
        if rx_budget > RX_BUDGET_MAX {
            return fail(format!("rx budget {rx_budget} exceeds {RX_BUDGET_MAX}"));
        }
        let doorbell = cfg.doorbell.unwrap_or_default();
        if let DoorbellPolicy::Deferred {
            threshold,
            min_occupancy,
            ..
        } = doorbell
        {
            if threshold == 0 {
                return fail("doorbell threshold must be positive".into());
            }
            if min_occupancy > params.ntxd {
                return fail(format!(
                    "doorbell min occupancy {min_occupancy} exceeds the {} descriptor ring",
                    params.ntxd
                ));
            }
        }
        let watchdog_interval = cfg.watchdog_interval.unwrap_or(WATCHDOG_INTERVAL);
        if watchdog_interval.is_zero() {
            return fail("watchdog interval must be positive".into());
        }
        let rx_refill_batch = cfg.rx_refill_batch.unwrap_or(RX_REFILL_BATCH);
        if rx_refill_batch == 0 {
            return fail("refill batch must be positive".into());
        }
        Ok(Tunables {
            submit_ring_size,
            tx_batch,
            tx_budget,
            rx_budget,
            doorbell,
            abdicate: cfg.abdicate.unwrap_or(false),
            lro: cfg.lro.unwrap_or(false),
            watchdog_interval,
            watchdog_checks: cfg.watchdog_checks.unwrap_or(WATCHDOG_CHECKS).max(1),
            rx_refill_batch,
            rx_initial_fill: cfg
                .rx_initial_fill
                .unwrap_or(RX_INITIAL_FILL)
                .min(params.nrxd),
        })
    }
}
