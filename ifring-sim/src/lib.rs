//! Simulated hardware for the `ifring` engine: a loopback NIC with real
//! descriptor rings, a bounce-buffer DMA arena and a heap buffer pool.

pub mod arena;
pub mod desc;
pub mod frame;
pub mod mmap;
pub mod nic;
pub mod pool;
pub mod sim;
pub mod stack;

pub use arena::DmaArena;
pub use nic::{NicStats, SimConfig, SimNic};
pub use pool::HeapPool;
pub use sim::{Leaks, Sim};
pub use stack::{ChannelStack, StackEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
