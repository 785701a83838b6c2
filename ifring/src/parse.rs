//! Header parsing for transmit offloads and flow hashing.

use etherparse::{
    Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, SingleVlanHeaderSlice,
    TcpHeaderSlice, UdpHeaderSlice,
};

use crate::error::ParseError;

pub(crate) const ETHERTYPE_IPV4: u16 = 0x0800;
pub(crate) const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
pub(crate) const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Bytes copied out of a packet to parse its headers.
pub const MAX_HDR_LEN: usize = 256;

/// Header layout handed to the device with offload requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Ethertype after any VLAN tag.
    pub etype: u16,
    /// L2 header length including a VLAN tag.
    pub ehdrlen: u16,
    pub ip_hlen: u16,
    pub ipproto: u8,
    /// TCP header length, zero for other protocols.
    pub tcp_hlen: u16,
}

/// Returns the ethertype after an optional VLAN tag and the L2 length.
pub(crate) fn parse_l2(frame: &[u8]) -> Result<(u16, usize), ParseError> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).map_err(|_| ParseError::Truncated("ethernet"))?;
    let mut etype = eth.ether_type().0;
    let mut len = eth.slice().len();
    if etype == ETHERTYPE_VLAN || etype == ETHERTYPE_QINQ {
        let vlan = SingleVlanHeaderSlice::from_slice(&frame[len..])
            .map_err(|_| ParseError::Truncated("vlan"))?;
        etype = vlan.ether_type().0;
        len += vlan.slice().len();
    }
    Ok((etype, len))
}

/// Parses the L2-L4 headers at the start of `frame`.
///
/// # Arguments
/// * `frame` - Contiguous packet head, typically `MAX_HDR_LEN` bytes.
/// * `need_l3` - Checksum or segmentation offload was requested, so the
///   packet must be IP.
/// * `tso` - Segmentation offload was requested, so the packet must be TCP.
pub fn parse_header(frame: &[u8], need_l3: bool, tso: bool) -> Result<HeaderInfo, ParseError> {
    let (etype, ehdrlen) = parse_l2(frame)?;
    let mut info = HeaderInfo {
        etype,
        ehdrlen: ehdrlen as u16,
        ..HeaderInfo::default()
    };
    let l3 = &frame[ehdrlen..];
    match etype {
        ETHERTYPE_IPV4 => {
            let ip = Ipv4HeaderSlice::from_slice(l3).map_err(|_| ParseError::Truncated("ipv4"))?;
            info.ip_hlen = u16::from(ip.ihl()) * 4;
            info.ipproto = ip.protocol().0;
        }
        ETHERTYPE_IPV6 => {
            let ip = Ipv6HeaderSlice::from_slice(l3).map_err(|_| ParseError::Truncated("ipv6"))?;
            info.ip_hlen = ip.slice().len() as u16;
            info.ipproto = ip.next_header().0;
        }
        other if need_l3 => return Err(ParseError::EtherType(other)),
        _ => return Ok(info),
    }
    if info.ipproto == IPPROTO_TCP {
        let l4 = &frame[ehdrlen + info.ip_hlen as usize..];
        let tcp = TcpHeaderSlice::from_slice(l4).map_err(|_| ParseError::Truncated("tcp"))?;
        info.tcp_hlen = u16::from(tcp.data_offset()) * 4;
    } else if tso {
        return Err(ParseError::NotTcp);
    }
    Ok(info)
}

/// Hashes the address/port tuple of an IP frame, `None` for anything else.
pub fn flow_hash(frame: &[u8]) -> Option<u32> {
    let (etype, ehdrlen) = parse_l2(frame).ok()?;
    let l3 = &frame[ehdrlen..];
    let mut hash = Fnv::new();
    let (proto, l4) = match etype {
        ETHERTYPE_IPV4 => {
            let ip = Ipv4HeaderSlice::from_slice(l3).ok()?;
            hash.write(&ip.source());
            hash.write(&ip.destination());
            (ip.protocol().0, &l3[ip.slice().len()..])
        }
        ETHERTYPE_IPV6 => {
            let ip = Ipv6HeaderSlice::from_slice(l3).ok()?;
            hash.write(&ip.source());
            hash.write(&ip.destination());
            (ip.next_header().0, &l3[ip.slice().len()..])
        }
        _ => return None,
    };
    let ports = match proto {
        IPPROTO_TCP => TcpHeaderSlice::from_slice(l4)
            .ok()
            .map(|t| (t.source_port(), t.destination_port())),
        IPPROTO_UDP => UdpHeaderSlice::from_slice(l4)
            .ok()
            .map(|u| (u.source_port(), u.destination_port())),
        _ => None,
    };
    hash.write(&[proto]);
    if let Some((sport, dport)) = ports {
        hash.write(&sport.to_be_bytes());
        hash.write(&dport.to_be_bytes());
    }
    Some(hash.finish())
}

struct Fnv(u32);

impl Fnv {
    fn new() -> Self {
        Fnv(0x811c_9dc5)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u32::from(*b);
            self.0 = self.0.wrapping_mul(0x0100_0193);
        }
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp_frame(vlan: Option<u16>, sport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(sport, 80, 1000, 4096);
        let payload = [7u8; 32];
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, &payload).unwrap();
        if let Some(id) = vlan {
            let tag = [0x81, 0x00, (id >> 8) as u8, id as u8];
            out.splice(12..12, tag);
        }
        out
    }

    fn udp6_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv6([1; 16], [2; 16], 64)
            .udp(5000, 6000);
        let mut out = Vec::with_capacity(builder.size(4));
        builder.write(&mut out, &[0u8; 4]).unwrap();
        out
    }

    #[test]
    fn parses_vlan_tcp() {
        let info = parse_header(&tcp_frame(Some(5), 1234), true, true).unwrap();
        assert_eq!(info.etype, ETHERTYPE_IPV4);
        assert_eq!(info.ehdrlen, 18);
        assert_eq!(info.ip_hlen, 20);
        assert_eq!(info.ipproto, IPPROTO_TCP);
        assert_eq!(info.tcp_hlen, 20);
    }

    #[test]
    fn tso_needs_tcp() {
        assert_eq!(parse_header(&udp6_frame(), true, true), Err(ParseError::NotTcp));
        let info = parse_header(&udp6_frame(), true, false).unwrap();
        assert_eq!((info.ehdrlen, info.ip_hlen, info.ipproto), (14, 40, IPPROTO_UDP));
    }

    #[test]
    fn truncated_headers_are_rejected() {
        let frame = tcp_frame(None, 1);
        assert!(matches!(
            parse_header(&frame[..30], true, false),
            Err(ParseError::Truncated(_))
        ));
    }

    #[test]
    fn flow_hash_separates_flows() {
        let a = flow_hash(&tcp_frame(None, 1000)).unwrap();
        let b = flow_hash(&tcp_frame(None, 1001)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, flow_hash(&tcp_frame(None, 1000)).unwrap());
        assert!(flow_hash(&[0u8; 10]).is_none());
    }
}
