//! # Packet Buffers
//!
//! ## Purpose
//!
//! Owned packet memory moving between the stack, the engine and the device.
//! Ownership is the transfer protocol: a buffer is moved into a slot table when
//! it is posted and moved back out when it is released, so a buffer can never
//! be reachable from two places at once.
//!
//! ## How it works
//!
//! A `Buffer` owns a boxed byte slice and, optionally, a handle to the pool it
//! came from. Dropping the buffer hands the memory back to that pool. A
//! `Packet` is an ordered chain of `Segment`s (buffer + offset + length) plus
//! the offload metadata the device needs. Packets that exceed a device's
//! scatter/gather limit can be `collapse`d (merge adjacent segments into spare
//! tailroom) or `defrag`mented (copy into a single fresh buffer).
//!
//! ## Main components
//!
//! - `Buffer`, `Recycle`, `BufferPool`: owned memory and the pool service.
//! - `Segment`, `Packet`, `PacketMeta`, `CsumFlags`: the packet chain.

use std::fmt;
use std::mem;
use std::sync::Arc;

/// Receives buffer memory back when a pooled `Buffer` is dropped.
pub trait Recycle: Send + Sync {
    fn recycle(&self, data: Box<[u8]>);
}

/// Buffer allocation service consumed by the engine.
pub trait BufferPool: Send + Sync {
    /// Allocates a buffer of at least `size` bytes, `None` when exhausted.
    fn alloc(&self, size: usize) -> Option<Buffer>;

    /// Largest buffer `alloc` can return.
    fn max_buf_size(&self) -> usize;
}

/// An owned byte buffer.
pub struct Buffer {
    data: Box<[u8]>,
    home: Option<Arc<dyn Recycle>>,
}

impl Buffer {
    /// Wraps memory that is not accounted to any pool.
    pub fn from_box(data: Box<[u8]>) -> Self {
        Buffer { data, home: None }
    }

    /// Wraps memory that goes back to `home` on drop.
    pub fn pooled(data: Box<[u8]>, home: Arc<dyn Recycle>) -> Self {
        Buffer {
            data,
            home: Some(home),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.recycle(mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

/// A window into a buffer.
#[derive(Debug)]
pub struct Segment {
    buf: Buffer,
    off: usize,
    len: usize,
}

impl Segment {
    /// # Panics
    /// If the window does not fit the buffer.
    pub fn new(buf: Buffer, off: usize, len: usize) -> Self {
        assert!(off + len <= buf.capacity(), "segment exceeds its buffer");
        Segment { buf, off, len }
    }

    /// A segment covering the whole buffer.
    pub fn full(buf: Buffer) -> Self {
        let len = buf.capacity();
        Segment { buf, off: 0, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buf.as_slice()[self.off..self.off + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.off, self.len);
        &mut self.buf.as_mut_slice()[off..off + len]
    }

    /// Free bytes after the window.
    pub fn tailroom(&self) -> usize {
        self.buf.capacity() - self.off - self.len
    }

    pub fn into_buffer(self) -> Buffer {
        self.buf
    }

    fn extend_from(&mut self, bytes: &[u8]) {
        let start = self.off + self.len;
        self.buf.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}

bitflags::bitflags! {
    /// Checksum and segmentation offload flags.
    ///
    /// The TX half requests work from the device, the RX half reports what the
    /// device already verified.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CsumFlags: u32 {
        const IP = 1 << 0;
        const TCP = 1 << 1;
        const UDP = 1 << 2;
        const TCP_IPV6 = 1 << 3;
        const UDP_IPV6 = 1 << 4;
        const IP_TSO = 1 << 5;
        const IP6_TSO = 1 << 6;

        const L3_CHECKED = 1 << 16;
        const L3_VALID = 1 << 17;
        const L4_VALID = 1 << 18;
        const PSEUDO_HDR = 1 << 19;
    }
}

impl CsumFlags {
    /// Flags that need the L2/L3/L4 header layout to encode.
    pub const TX_OFFLOAD: CsumFlags = CsumFlags::IP
        .union(CsumFlags::TCP)
        .union(CsumFlags::UDP)
        .union(CsumFlags::TCP_IPV6)
        .union(CsumFlags::UDP_IPV6)
        .union(CsumFlags::IP_TSO)
        .union(CsumFlags::IP6_TSO);

    pub fn is_tso(&self) -> bool {
        self.intersects(CsumFlags::IP_TSO | CsumFlags::IP6_TSO)
    }
}

/// Per-packet metadata carried next to the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Flow identifier (RSS hash) used to pick a queue.
    pub flowid: Option<u32>,
    pub rss_type: u8,
    pub vtag: Option<u16>,
    pub csum_flags: CsumFlags,
    pub csum_data: u32,
    /// MSS for TSO packets.
    pub tso_segsz: u16,
    pub mcast: bool,
    pub bcast: bool,
}

/// An ordered chain of segments.
#[derive(Debug, Default)]
pub struct Packet {
    segs: Vec<Segment>,
    pub meta: PacketMeta,
}

impl Packet {
    pub fn new() -> Self {
        Packet::default()
    }

    pub fn from_segments(segs: Vec<Segment>) -> Self {
        Packet {
            segs,
            meta: PacketMeta::default(),
        }
    }

    pub fn push(&mut self, seg: Segment) {
        self.segs.push(seg);
    }

    /// Total payload length over all segments.
    pub fn len(&self) -> usize {
        self.segs.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_segments(&self) -> usize {
        self.segs.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segs
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segs
    }

    /// Non-empty segment windows in order.
    pub fn fragments(&self) -> Vec<&[u8]> {
        self.segs
            .iter()
            .filter(|s| !s.is_empty())
            .map(Segment::data)
            .collect()
    }

    /// Copies up to `n` leading bytes into a contiguous vector.
    pub fn copy_head(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.len()));
        for seg in &self.segs {
            let want = n - out.len();
            if want == 0 {
                break;
            }
            let data = seg.data();
            out.extend_from_slice(&data[..want.min(data.len())]);
        }
        out
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.copy_head(self.len())
    }

    /// Drops `n` bytes from the front of the chain.
    pub fn trim_front(&mut self, mut n: usize) {
        while n > 0 && !self.segs.is_empty() {
            let seg = &mut self.segs[0];
            if seg.len <= n {
                n -= seg.len;
                self.segs.remove(0);
            } else {
                seg.off += n;
                seg.len -= n;
                n = 0;
            }
        }
    }

    /// Shortens the chain to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        let mut kept = 0;
        let mut keep_segs = 0;
        for seg in &mut self.segs {
            if kept >= len {
                break;
            }
            seg.len = seg.len.min(len - kept);
            kept += seg.len;
            keep_segs += 1;
        }
        self.segs.truncate(keep_segs);
    }

    /// Moves every segment of `other` to the end of this chain.
    pub fn append(&mut self, other: Packet) {
        self.segs.extend(other.segs);
    }

    /// Merges adjacent segments into their predecessors' tailroom until the
    /// chain has at most `max_segs` segments.
    ///
    /// # Returns
    /// The collapsed packet, or the packet with its data intact when the limit
    /// cannot be reached this way.
    pub fn collapse(mut self, max_segs: usize) -> Result<Packet, Packet> {
        self.segs.retain(|s| !s.is_empty());
        let mut i = 0;
        while self.segs.len() > max_segs {
            if i + 1 >= self.segs.len() {
                return Err(self);
            }
            let (head, tail) = self.segs.split_at_mut(i + 1);
            let (prev, next) = (&mut head[i], &tail[0]);
            if prev.tailroom() >= next.len() {
                prev.extend_from(next.data());
                self.segs.remove(i + 1);
            } else {
                i += 1;
            }
        }
        Ok(self)
    }

    /// Copies the whole chain into one buffer from `pool`.
    ///
    /// # Returns
    /// The single-segment packet, or the original packet when the pool cannot
    /// supply a large enough buffer.
    pub fn defrag(self, pool: &dyn BufferPool) -> Result<Packet, Packet> {
        let total = self.len();
        if total > pool.max_buf_size() {
            return Err(self);
        }
        let Some(mut buf) = pool.alloc(total) else {
            return Err(self);
        };
        let mut at = 0;
        for seg in &self.segs {
            let data = seg.data();
            buf.as_mut_slice()[at..at + data.len()].copy_from_slice(data);
            at += data.len();
        }
        Ok(Packet {
            segs: vec![Segment::new(buf, 0, total)],
            meta: self.meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(bytes: &[u8], capacity: usize) -> Segment {
        let mut data = vec![0u8; capacity].into_boxed_slice();
        data[..bytes.len()].copy_from_slice(bytes);
        Segment::new(Buffer::from_box(data), 0, bytes.len())
    }

    struct Unbounded;

    impl BufferPool for Unbounded {
        fn alloc(&self, size: usize) -> Option<Buffer> {
            Some(Buffer::from_box(vec![0u8; size].into_boxed_slice()))
        }
        fn max_buf_size(&self) -> usize {
            1 << 16
        }
    }

    #[test]
    fn collapse_uses_tailroom() {
        let pkt = Packet::from_segments(vec![seg(b"ab", 8), seg(b"cd", 2), seg(b"ef", 2)]);
        let pkt = pkt.collapse(1).unwrap();
        assert_eq!(pkt.num_segments(), 1);
        assert_eq!(pkt.to_vec(), b"abcdef");
    }

    #[test]
    fn collapse_fails_without_tailroom() {
        let pkt = Packet::from_segments(vec![seg(b"ab", 2), seg(b"cd", 2), seg(b"ef", 2)]);
        let pkt = pkt.collapse(2).unwrap_err();
        assert_eq!(pkt.to_vec(), b"abcdef");
    }

    #[test]
    fn defrag_copies_into_one_buffer() {
        let mut pkt = Packet::from_segments(vec![seg(b"ab", 2), seg(b"cd", 2)]);
        pkt.meta.vtag = Some(7);
        let pkt = pkt.defrag(&Unbounded).unwrap();
        assert_eq!(pkt.num_segments(), 1);
        assert_eq!(pkt.to_vec(), b"abcd");
        assert_eq!(pkt.meta.vtag, Some(7));
    }

    #[test]
    fn trim_and_truncate() {
        let mut pkt = Packet::from_segments(vec![seg(b"abc", 3), seg(b"defg", 4)]);
        pkt.trim_front(4);
        assert_eq!(pkt.to_vec(), b"efg");
        pkt.truncate(2);
        assert_eq!(pkt.to_vec(), b"ef");
        assert_eq!(pkt.copy_head(1), b"e");
    }
}
