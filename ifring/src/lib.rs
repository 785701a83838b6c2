//! Hardware-agnostic network interface driver engine.
//!
//! The engine owns TX/RX descriptor rings, buffer lifecycle and the deferred
//! work that moves packets between an upstream [`Stack`] and a [`Device`]
//! backend. A backend provides register-level operations; buffer memory and
//! DMA mappings come from [`BufferPool`] and [`DmaMapper`] services.

pub mod buf;
pub mod config;
pub mod context;
pub mod device;
pub mod dma;
pub mod error;
pub mod free_list;
pub mod lro;
pub mod mp_ring;
pub mod parse;
pub mod ring;
pub mod rxq;
pub mod slot;
pub mod taskq;
pub mod txq;

#[cfg(test)]
mod tests;

pub use buf::{Buffer, BufferPool, CsumFlags, Packet, PacketMeta, Recycle, Segment};
pub use config::{DoorbellPolicy, EngineConfig};
pub use context::{Context, ContextStats, Interrupts, Stack};
pub use device::{Device, DeviceParams, Encapped, LinkState, PktInfo, RxFrag, RxdInfo};
pub use dma::{DmaMapper, DmaSeg, Mapping};
pub use error::{DeviceError, EncapError, EngineError, MapError, ParseError, RefillError, SubmitError};
pub use txq::QueueState;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Services a queue operation needs, borrowed for the duration of the call.
pub(crate) struct Services<'a> {
    pub dev: &'a dyn Device,
    pub pool: &'a dyn BufferPool,
    pub mapper: &'a dyn DmaMapper,
}

/// Locks `m`, taking over the guard of a poisoned lock.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
