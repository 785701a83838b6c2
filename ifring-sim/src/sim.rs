//! One engine context wired to a simulated NIC, a DMA arena, a heap pool and
//! a channel stack.

use std::io;
use std::sync::Arc;

use ifring::{Context, EngineConfig};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::arena::DmaArena;
use crate::nic::{SimConfig, SimNic};
use crate::pool::HeapPool;
use crate::stack::{ChannelStack, StackEvent};

/// Largest buffer the pool hands out, enough to defragment a jumbo frame.
pub const POOL_MAX_BUF: usize = 16384;
pub const POOL_LIMIT: usize = 1 << 16;

pub struct Sim {
    pub nic: Arc<SimNic>,
    pub arena: Arc<DmaArena>,
    pub pool: Arc<HeapPool>,
    pub ctx: Context,
    events: Option<UnboundedReceiver<StackEvent>>,
}

impl Sim {
    /// Attaches and initialises an engine over a fresh simulated device.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(cfg: SimConfig, engine: EngineConfig) -> io::Result<Self> {
        let params = cfg.params();
        let frame_size = params.rx_buf_size();
        // every descriptor of either ring holds at most one frame, plus one
        // packet per queue mapped while the drain checks for room
        let per_queue = (cfg.ntxd + cfg.nrxd + cfg.tx_tso_segments_max) as usize;
        let frames = usize::from(cfg.nqsets) * per_queue;
        let arena = Arc::new(DmaArena::new(frames, frame_size, None)?);
        let pool = Arc::new(HeapPool::new(POOL_LIMIT, POOL_MAX_BUF));
        let nic = SimNic::new(cfg, arena.clone())?;
        let (stack, events) = ChannelStack::new();
        let ctx = Context::attach(nic.clone(), pool.clone(), arena.clone(), stack, engine)
            .map_err(|e| io::Error::other(format!("Failed to attach engine: {e}")))?;
        nic.set_interrupts(ctx.interrupts());
        ctx.init();
        Ok(Sim {
            nic,
            arena,
            pool,
            ctx,
            events: Some(events),
        })
    }

    /// The stack's event stream. Events are dropped with the `Sim` unless
    /// taken.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<StackEvent>> {
        self.events.take()
    }

    /// Detaches the engine and waits for its tasks.
    pub async fn shutdown(self) {
        drop(self.events);
        self.ctx.detach().await;
    }
}

/// Buffers and mappings still held after a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaks {
    pub buffers: usize,
    pub mappings: usize,
}

impl Leaks {
    pub fn check(pool: &HeapPool, arena: &DmaArena) -> Self {
        Leaks {
            buffers: pool.outstanding(),
            mappings: arena.mapped(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.buffers == 0 && self.mappings == 0
    }
}
