//! # Anonymous Memory Mappings
//!
//! ## Purpose
//!
//! Backing store for the simulated device: the DMA arena and the descriptor
//! rings both live in page-aligned anonymous mappings, the way real device
//! memory is carved out of pinned pages.
//!
//! ## How it works
//!
//! `OwnedMmap` wraps a `libc::mmap` region and unmaps it on drop. Huge pages are
//! used when asked for, or when `/proc/meminfo` reports free 2MB pages and the
//! caller left the choice open.
//!
//! ## Main components
//!
//! - `OwnedMmap`: owner of one mapped region.
//! - `hugepages_free()`: free 2MB huge pages reported by the kernel.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// An anonymous private mapping, unmapped on drop.
pub struct OwnedMmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl OwnedMmap {
    /// Maps at least `size` zeroed bytes, rounded up to the page size.
    ///
    /// `huge_page` forces huge pages on or off; with `None` they are used when
    /// the kernel has free 2MB pages.
    pub fn anonymous(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        let huge_tlb = match huge_page {
            Some(yes) => yes,
            None => hugepages_free().unwrap_or(0) > 0,
        };
        let page_size = if huge_tlb {
            HUGE_PAGE_SIZE
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let len = size.max(1).next_multiple_of(page_size);
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | if huge_tlb {
                libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
            } else {
                0
            };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if huge_tlb && huge_page.is_none() {
                log::debug!("huge page mapping of {len} bytes failed ({err}), using base pages");
                return Self::anonymous(size, Some(false));
            }
            return Err(err);
        }
        Ok(OwnedMmap { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.ptr, self.len) };
        if res < 0 {
            log::error!("Failed to unmap memory: {}", io::Error::last_os_error());
        }
    }
}

// SAFETY: the mapping is plain memory owned by this value; callers synchronise
// access to its contents.
unsafe impl Send for OwnedMmap {}
unsafe impl Sync for OwnedMmap {}

/// Free 2MB huge pages, from `/proc/meminfo`.
pub fn hugepages_free() -> io::Result<u64> {
    let reader = BufReader::new(File::open("/proc/meminfo")?);
    let mut size_kb = None;
    let mut free = None;
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => size_kb = Some(value.parse::<u64>().map_err(io::Error::other)?),
            "HugePages_Free" => free = Some(value.parse::<u64>().map_err(io::Error::other)?),
            _ => {}
        }
    }
    match (size_kb, free) {
        (Some(2048), Some(n)) => Ok(n),
        _ => Ok(0),
    }
}
