//! # Test Frames
//!
//! ## Purpose
//!
//! Builds the UDP/IPv4/Ethernet frames the simulator pushes through the engine
//! and checks what comes back.
//!
//! ## How it works
//!
//! Frames are assembled with `etherparse::PacketBuilder`. Each payload starts
//! with a little-endian sequence number followed by a byte pattern derived from
//! it, so a receiver can tell a lost frame from a corrupted one. `to_packet`
//! scatters a frame over several pool buffers to exercise the scatter/gather
//! path.

use std::io;
use std::net::SocketAddrV4;

use etherparse::{PacketBuilder, SlicedPacket, TransportSlice};
use ifring::{BufferPool, Packet, Segment};

/// Ethernet, IPv4 and UDP headers.
pub const UDP_HEADER_LEN: usize = 42;

#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub mac: [u8; 6],
    pub addr: SocketAddrV4,
}

pub fn udp_frame(src: &Endpoint, dst: &Endpoint, payload: &[u8]) -> io::Result<Vec<u8>> {
    let builder = PacketBuilder::ethernet2(src.mac, dst.mac)
        .ipv4(src.addr.ip().octets(), dst.addr.ip().octets(), 64)
        .udp(src.addr.port(), dst.addr.port());
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut out, payload)
        .map_err(|e| io::Error::other(format!("Error writing packet: {e}")))?;
    Ok(out)
}

/// Destination port and payload of a UDP frame.
pub fn udp_payload(frame: &[u8]) -> Option<(u16, &[u8])> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;
    match sliced.transport {
        Some(TransportSlice::Udp(udp)) => Some((udp.destination_port(), udp.payload())),
        _ => None,
    }
}

fn pattern(seq: u64, i: usize) -> u8 {
    (seq as usize).wrapping_add(i).wrapping_mul(31) as u8
}

/// A `size`-byte payload carrying `seq`. `size` is at least 8.
pub fn seq_payload(seq: u64, size: usize) -> Vec<u8> {
    let mut p = Vec::with_capacity(size.max(8));
    p.extend_from_slice(&seq.to_le_bytes());
    p.extend((8..size).map(|i| pattern(seq, i)));
    p
}

/// Sequence number of an intact payload made by `seq_payload`.
pub fn payload_seq(payload: &[u8]) -> Option<u64> {
    let seq = u64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    payload[8..]
        .iter()
        .enumerate()
        .all(|(i, &b)| b == pattern(seq, i + 8))
        .then_some(seq)
}

/// Copies `frame` into `seg_len`-byte pool buffers.
///
/// # Returns
/// `None` when the pool runs dry.
pub fn to_packet(pool: &dyn BufferPool, frame: &[u8], seg_len: usize) -> Option<Packet> {
    let mut pkt = Packet::new();
    for chunk in frame.chunks(seg_len.max(1)) {
        let mut buf = pool.alloc(seg_len.max(chunk.len()))?;
        buf.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
        pkt.push(Segment::new(buf, 0, chunk.len()));
    }
    Some(pkt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint {
                mac: [0x02, 0, 0, 0, 0, 1],
                addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9000),
            },
            Endpoint {
                mac: [0x02, 0, 0, 0, 0, 2],
                addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9001),
            },
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let (src, dst) = endpoints();
        let frame = udp_frame(&src, &dst, &seq_payload(77, 100)).unwrap();
        assert_eq!(frame.len(), UDP_HEADER_LEN + 100);
        let (port, payload) = udp_payload(&frame).unwrap();
        assert_eq!(port, 9001);
        assert_eq!(payload_seq(payload), Some(77));
    }

    #[test]
    fn test_corruption_detected() {
        let mut payload = seq_payload(5, 64);
        payload[40] ^= 1;
        assert_eq!(payload_seq(&payload), None);
        assert_eq!(payload_seq(b"short"), None);
    }
}
