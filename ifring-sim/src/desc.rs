//! Descriptor rings of the simulated NIC, laid out the way hardware reads them:
//! fixed-size little records in one page-aligned mapping.

use std::io;
use std::marker::PhantomData;

use static_assertions::const_assert_eq;

use crate::mmap::OwnedMmap;

/// First descriptor of a packet.
pub const TXD_SOP: u16 = 1 << 0;
/// Last descriptor of a packet.
pub const TXD_EOP: u16 = 1 << 1;
/// `vtag` holds a VLAN tag to insert.
pub const TXD_VLAN: u16 = 1 << 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub vtag: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDesc {
    pub addr: u64,
    pub rsvd: u64,
}

const_assert_eq!(size_of::<TxDesc>(), 16);
const_assert_eq!(size_of::<RxDesc>(), 16);

/// A power-of-two ring of `T` descriptors.
pub struct DescRing<T> {
    mmap: OwnedMmap,
    len: u32,
    _desc: PhantomData<T>,
}

impl<T: Copy> DescRing<T> {
    pub fn new(len: u32) -> io::Result<Self> {
        debug_assert!(len.is_power_of_two());
        Ok(DescRing {
            mmap: OwnedMmap::anonymous(len as usize * size_of::<T>(), Some(false))?,
            len,
            _desc: PhantomData,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next(&self, idx: u32) -> u32 {
        (idx + 1) & (self.len - 1)
    }

    pub fn get(&self, idx: u32) -> T {
        assert!(idx < self.len, "descriptor {idx} out of {}", self.len);
        unsafe { self.mmap.as_ptr().cast::<T>().add(idx as usize).read() }
    }

    pub fn set(&mut self, idx: u32, desc: T) {
        assert!(idx < self.len, "descriptor {idx} out of {}", self.len);
        unsafe { self.mmap.as_ptr().cast::<T>().add(idx as usize).write(desc) }
    }

    /// Zeroes every descriptor.
    pub fn clear(&mut self) {
        unsafe { self.mmap.as_ptr().write_bytes(0, self.mmap.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_wrap() {
        let mut ring = DescRing::<TxDesc>::new(8).unwrap();
        let d = TxDesc {
            addr: 0x1000,
            len: 60,
            flags: TXD_SOP | TXD_EOP,
            vtag: 0,
        };
        ring.set(7, d);
        assert_eq!(ring.get(7), d);
        assert_eq!(ring.next(7), 0);
        ring.clear();
        assert_eq!(ring.get(7), TxDesc::default());
    }
}
