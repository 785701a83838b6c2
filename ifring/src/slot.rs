//! Ring position to in-flight buffer table.
//!
//! Each descriptor ring has one `SlotTable` with the same number of entries.
//! A slot owns at most one buffer and its mapping. `destroy` is the single
//! place where everything still bound on a teardown or error path is released.

use std::fmt;

use crate::dma::{DmaMapper, Mapping};

/// Returned by `bind` when the slot already holds a buffer. Carries the
/// rejected buffer and mapping back to the caller.
#[derive(Debug)]
pub struct AlreadyBound<B> {
    pub idx: usize,
    pub buf: B,
    pub mapping: Mapping,
}

impl<B> fmt::Display for AlreadyBound<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} is already bound", self.idx)
    }
}

impl<B: fmt::Debug> std::error::Error for AlreadyBound<B> {}

pub struct SlotTable<B> {
    slots: Box<[Option<(B, Mapping)>]>,
    bound: usize,
}

impl<B> SlotTable<B> {
    pub fn create(size: usize) -> Self {
        SlotTable {
            slots: (0..size).map(|_| None).collect(),
            bound: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots currently holding a buffer.
    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn is_bound(&self, idx: usize) -> bool {
        self.slots[idx].is_some()
    }

    pub fn get(&self, idx: usize) -> Option<&B> {
        self.slots[idx].as_ref().map(|(b, _)| b)
    }

    /// Attaches `buf` and `mapping` to slot `idx`.
    ///
    /// # Errors
    /// `AlreadyBound` if the slot is occupied. This is an invariant violation
    /// and panics in debug builds.
    pub fn bind(&mut self, idx: usize, buf: B, mapping: Mapping) -> Result<(), AlreadyBound<B>> {
        let slot = &mut self.slots[idx];
        debug_assert!(slot.is_none(), "slot {idx} is already bound");
        if slot.is_some() {
            return Err(AlreadyBound { idx, buf, mapping });
        }
        *slot = Some((buf, mapping));
        self.bound += 1;
        Ok(())
    }

    /// Detaches whatever slot `idx` holds.
    pub fn release(&mut self, idx: usize) -> Option<(B, Mapping)> {
        let taken = self.slots[idx].take();
        if taken.is_some() {
            self.bound -= 1;
        }
        taken
    }

    /// Unmaps and drops every bound slot.
    ///
    /// # Returns
    /// How many slots were still bound.
    pub fn destroy(&mut self, mapper: &dyn DmaMapper) -> usize {
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if let Some((buf, mapping)) = slot.take() {
                mapper.unmap(mapping);
                drop(buf);
                released += 1;
            }
        }
        self.bound = 0;
        released
    }
}
