//! Receive coalescing of in-order TCP/IPv4 segments.
//!
//! Consecutive segments of one flow are chained behind the first segment's
//! headers and delivered as a single packet with updated IP length, IP
//! checksum, ACK and window. Only segments whose checksum the device already
//! verified are merged, and the merged packet is marked as verified. A packet
//! of a held flow that cannot be merged flushes the held packet first, so a
//! flow is never reordered.

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};

use crate::buf::{CsumFlags, Packet};
use crate::parse::{ETHERTYPE_IPV4, IPPROTO_TCP, MAX_HDR_LEN, parse_l2};

const MAX_IP_LEN: usize = 65535;
const IPV4_HLEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowKey {
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    vtag: Option<u16>,
}

/// A mergeable data segment.
struct TcpSeg {
    l2: usize,
    tcp_hlen: usize,
    ip_len: usize,
    seq: u32,
    ack: u32,
    window: u16,
    payload: usize,
    options: Vec<u8>,
}

impl TcpSeg {
    fn hdr_len(&self) -> usize {
        self.l2 + IPV4_HLEN + self.tcp_hlen
    }
}

fn inspect(pkt: &Packet) -> Option<(FlowKey, Option<TcpSeg>)> {
    let head = pkt.copy_head(MAX_HDR_LEN);
    let (etype, l2) = parse_l2(&head).ok()?;
    if etype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = Ipv4HeaderSlice::from_slice(&head[l2..]).ok()?;
    if ip.protocol().0 != IPPROTO_TCP {
        return None;
    }
    let ip_hlen = usize::from(ip.ihl()) * 4;
    let tcp = TcpHeaderSlice::from_slice(&head[l2 + ip_hlen..]).ok()?;
    let key = FlowKey {
        src: ip.source(),
        dst: ip.destination(),
        sport: tcp.source_port(),
        dport: tcp.destination_port(),
        vtag: pkt.meta.vtag,
    };

    let ip_len = usize::from(ip.total_len());
    let tcp_hlen = usize::from(tcp.data_offset()) * 4;
    let plain_ack = tcp.ack() && !(tcp.syn() || tcp.fin() || tcp.rst() || tcp.urg() || tcp.ece() || tcp.cwr());
    let mergeable = pkt.meta.csum_flags.contains(CsumFlags::L4_VALID)
        && ip_hlen == IPV4_HLEN
        && !ip.is_fragmenting_payload()
        && plain_ack
        && ip_len > ip_hlen + tcp_hlen
        && pkt.len() >= l2 + ip_len
        && pkt.segments().first().map(|s| s.len()).unwrap_or(0) >= l2 + ip_hlen + tcp_hlen;
    if !mergeable {
        return Some((key, None));
    }
    let seg = TcpSeg {
        l2,
        tcp_hlen,
        ip_len,
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        window: tcp.window_size(),
        payload: ip_len - ip_hlen - tcp_hlen,
        options: tcp.options().to_vec(),
    };
    Some((key, Some(seg)))
}

struct Entry {
    key: FlowKey,
    pkt: Packet,
    l2: usize,
    tcp_hlen: usize,
    ip_len: usize,
    next_seq: u32,
    ack: u32,
    window: u16,
    options: Vec<u8>,
    merged: u32,
}

impl Entry {
    fn new(mut pkt: Packet, key: FlowKey, seg: TcpSeg) -> Self {
        pkt.truncate(seg.l2 + seg.ip_len);
        Entry {
            key,
            pkt,
            l2: seg.l2,
            tcp_hlen: seg.tcp_hlen,
            ip_len: seg.ip_len,
            next_seq: seg.seq.wrapping_add(seg.payload as u32),
            ack: seg.ack,
            window: seg.window,
            options: seg.options,
            merged: 0,
        }
    }

    fn can_merge(&self, seg: &TcpSeg) -> bool {
        seg.seq == self.next_seq
            && seg.tcp_hlen == self.tcp_hlen
            && seg.options == self.options
            && self.ip_len + seg.payload <= MAX_IP_LEN
            && seg.ack.wrapping_sub(self.ack) as i32 >= 0
    }

    fn merge(&mut self, mut pkt: Packet, seg: &TcpSeg) {
        pkt.truncate(seg.l2 + seg.ip_len);
        pkt.trim_front(seg.hdr_len());
        self.pkt.append(pkt);
        self.ip_len += seg.payload;
        self.next_seq = self.next_seq.wrapping_add(seg.payload as u32);
        self.ack = seg.ack;
        self.window = seg.window;
        self.merged += 1;
    }

    fn finish(mut self) -> Packet {
        if self.merged == 0 {
            return self.pkt;
        }
        let (l2, ip_len, ack, window) = (self.l2, self.ip_len, self.ack, self.window);
        let hdr = &mut self.pkt.segments_mut()[0].data_mut()[l2..];
        hdr[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
        hdr[10..12].copy_from_slice(&[0, 0]);
        let csum = ipv4_checksum(&hdr[..IPV4_HLEN]);
        hdr[10..12].copy_from_slice(&csum.to_be_bytes());
        let tcp = &mut hdr[IPV4_HLEN..];
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        tcp[14..16].copy_from_slice(&window.to_be_bytes());
        self.pkt.meta.csum_flags |=
            CsumFlags::L3_CHECKED | CsumFlags::L3_VALID | CsumFlags::L4_VALID | CsumFlags::PSEUDO_HDR;
        self.pkt.meta.csum_data = 0xffff;
        self.pkt
    }
}

fn ipv4_checksum(hdr: &[u8]) -> u16 {
    let mut sum: u32 = hdr
        .chunks(2)
        .map(|w| u32::from(w[0]) << 8 | u32::from(*w.get(1).unwrap_or(&0)))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LroStats {
    /// Segments merged into a held packet.
    pub queued: u64,
    /// Held packets delivered.
    pub flushed: u64,
}

pub struct Lro {
    entries: Vec<Entry>,
    max_entries: usize,
    stats: LroStats,
}

impl Lro {
    pub fn new(max_entries: usize) -> Self {
        Lro {
            entries: Vec::with_capacity(max_entries),
            max_entries: max_entries.max(1),
            stats: LroStats::default(),
        }
    }

    /// Holds `pkt` for coalescing or passes it (and anything it displaces)
    /// to `out`.
    pub fn rx(&mut self, pkt: Packet, out: &mut impl FnMut(Packet)) {
        let Some((key, seg)) = inspect(&pkt) else {
            out(pkt);
            return;
        };
        let pos = self.entries.iter().position(|e| e.key == key);
        match (pos, seg) {
            (Some(i), Some(seg)) if self.entries[i].can_merge(&seg) => {
                self.entries[i].merge(pkt, &seg);
                self.stats.queued += 1;
            }
            (Some(i), seg) => {
                self.flush_at(i, out);
                match seg {
                    Some(seg) => self.start(pkt, key, seg, out),
                    None => out(pkt),
                }
            }
            (None, Some(seg)) => self.start(pkt, key, seg, out),
            (None, None) => out(pkt),
        }
    }

    fn start(&mut self, pkt: Packet, key: FlowKey, seg: TcpSeg, out: &mut impl FnMut(Packet)) {
        if self.entries.len() == self.max_entries {
            self.flush_at(0, out);
        }
        self.entries.push(Entry::new(pkt, key, seg));
    }

    fn flush_at(&mut self, i: usize, out: &mut impl FnMut(Packet)) {
        let entry = self.entries.remove(i);
        self.stats.flushed += 1;
        out(entry.finish());
    }

    /// Delivers every held packet.
    pub fn flush_all(&mut self, out: &mut impl FnMut(Packet)) {
        for entry in self.entries.drain(..) {
            self.stats.flushed += 1;
            out(entry.finish());
        }
    }

    pub fn stats(&self) -> LroStats {
        self.stats
    }
}
