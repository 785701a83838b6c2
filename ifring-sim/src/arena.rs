//! # DMA Arena
//!
//! ## Purpose
//!
//! A bounce-buffer IOMMU for the simulated device. Packet memory handed to the
//! engine lives on the heap; the device only ever sees bus addresses inside one
//! mapped arena, so every mapping copies through fixed-size frames.
//!
//! ## How it works
//!
//! The arena is one anonymous mapping cut into `frame_size` frames with a free
//! stack of frame numbers. `map` takes one frame per fragment, or several for a
//! fragment larger than a frame, copies the fragment in and reports one
//! segment per frame. `sync_for_cpu` copies device writes back out and `unmap`
//! returns the frames. Bus addresses start at `IOVA_BASE` so a zero address is
//! never valid.
//!
//! Mapping failures can be injected to exercise the engine's error paths.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::{io, ptr};

use ifring::{DmaMapper, DmaSeg, MapError, Mapping};

use crate::mmap::OwnedMmap;

pub const IOVA_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub frames: usize,
    pub free_frames: usize,
    /// Live mappings.
    pub mapped: usize,
    pub maps: u64,
    pub injected_faults: u64,
    pub exhausted: u64,
}

pub struct DmaArena {
    mmap: OwnedMmap,
    frame_size: usize,
    frames: usize,
    free: Mutex<Vec<u32>>,
    mapped: AtomicUsize,
    maps: AtomicU64,
    /// Fail every n-th `map` call; 0 disables.
    fault_every: AtomicU64,
    injected: AtomicU64,
    exhausted: AtomicU64,
}

impl DmaArena {
    pub fn new(frames: usize, frame_size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        if frames == 0 || frame_size == 0 || frames > u32::MAX as usize {
            return Err(io::Error::other(format!(
                "invalid arena geometry {frames} x {frame_size}"
            )));
        }
        let mmap = OwnedMmap::anonymous(frames * frame_size, huge_page)?;
        log::debug!(
            "DMA arena: {frames} frames of {frame_size} bytes in {} mapped bytes",
            mmap.len()
        );
        Ok(DmaArena {
            mmap,
            frame_size,
            frames,
            free: Mutex::new((0..frames as u32).rev().collect()),
            mapped: AtomicUsize::new(0),
            maps: AtomicU64::new(0),
            fault_every: AtomicU64::new(0),
            injected: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Makes every `n`-th mapping fail with `NoMemory`; 0 turns faults off.
    pub fn inject_faults(&self, n: u64) {
        self.fault_every.store(n, Ordering::Relaxed);
    }

    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            frames: self.frames,
            free_frames: self.free.lock().map_or(0, |f| f.len()),
            mapped: self.mapped(),
            maps: self.maps.load(Ordering::Relaxed),
            injected_faults: self.injected.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Byte offset of `addr..addr+len` in the arena.
    fn offset(&self, addr: u64, len: usize) -> Option<usize> {
        let off = usize::try_from(addr.checked_sub(IOVA_BASE)?).ok()?;
        (off.checked_add(len)? <= self.frames * self.frame_size).then_some(off)
    }

    /// Device read of `dst.len()` bytes at bus address `addr`.
    ///
    /// # Returns
    /// `false` for an address outside the arena.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> bool {
        let Some(off) = self.offset(addr, dst.len()) else {
            return false;
        };
        unsafe { ptr::copy_nonoverlapping(self.mmap.as_ptr().add(off), dst.as_mut_ptr(), dst.len()) };
        true
    }

    /// Device write of `src` at bus address `addr`.
    pub fn write(&self, addr: u64, src: &[u8]) -> bool {
        let Some(off) = self.offset(addr, src.len()) else {
            return false;
        };
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.mmap.as_ptr().add(off), src.len()) };
        true
    }

    fn frame_addr(&self, frame: u32) -> u64 {
        IOVA_BASE + u64::from(frame) * self.frame_size as u64
    }

    fn addr_frame(&self, addr: u64) -> Option<u32> {
        let off = self.offset(addr, 0)?;
        u32::try_from(off / self.frame_size).ok()
    }

    fn release(&self, frames: impl IntoIterator<Item = u32>) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.extend(frames);
    }
}

impl DmaMapper for DmaArena {
    fn map(&self, frags: &[&[u8]], max_segs: usize) -> Result<Mapping, MapError> {
        let n = self.maps.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.fault_every.load(Ordering::Relaxed);
        if every != 0 && n % every == 0 {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(MapError::NoMemory);
        }
        let chunks: Vec<&[u8]> = frags
            .iter()
            .flat_map(|f| f.chunks(self.frame_size))
            .collect();
        if chunks.len() > max_segs {
            return Err(MapError::TooManySegments);
        }
        let frames = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            if free.len() < chunks.len() {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(MapError::NoMemory);
            }
            let at = free.len() - chunks.len();
            free.split_off(at)
        };
        let segs = chunks
            .iter()
            .zip(&frames)
            .map(|(chunk, &frame)| {
                let addr = self.frame_addr(frame);
                self.write(addr, chunk);
                DmaSeg {
                    addr,
                    len: chunk.len() as u32,
                }
            })
            .collect();
        self.mapped.fetch_add(1, Ordering::AcqRel);
        Ok(Mapping::new(segs, n))
    }

    fn sync_for_cpu(&self, mapping: &Mapping, dst: &mut [u8]) {
        let mut at = 0;
        for seg in mapping.segs() {
            let end = (at + seg.len as usize).min(dst.len());
            if !self.read(seg.addr, &mut dst[at..end]) {
                log::error!("sync of unmapped address {:#x}", seg.addr);
            }
            at = end;
        }
    }

    fn unmap(&self, mapping: Mapping) {
        let frames: Vec<u32> = mapping
            .segs()
            .iter()
            .filter_map(|s| self.addr_frame(s.addr))
            .collect();
        self.release(frames);
        self.mapped.fetch_sub(1, Ordering::AcqRel);
    }
}
