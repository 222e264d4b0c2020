//! Flow identifiers.

use std::fmt;
use std::net::Ipv4Addr;

use crate::datapath::{Packet, Protocol};

/// One direction of a flow: the five-tuple as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Source IP address.
    pub saddr: Ipv4Addr,
    /// Source port.
    pub sport: u16,
    /// Destination IP address.
    pub daddr: Ipv4Addr,
    /// Destination port.
    pub dport: u16,
    /// IP protocol number.
    pub protocol: u8,
}

impl FlowId {
    /// Creates a new flow identifier.
    #[inline]
    #[must_use]
    pub const fn new(saddr: Ipv4Addr, sport: u16, daddr: Ipv4Addr, dport: u16, protocol: u8) -> Self {
        Self {
            saddr,
            sport,
            daddr,
            dport,
            protocol,
        }
    }

    /// Returns the identifier of the opposite direction.
    #[inline]
    #[must_use]
    pub const fn reverse(&self) -> Self {
        Self {
            saddr: self.daddr,
            sport: self.dport,
            daddr: self.saddr,
            dport: self.sport,
            protocol: self.protocol,
        }
    }

    /// Returns the transport protocol.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> Protocol {
        Protocol::from(self.protocol)
    }

    /// Returns the 16-bit words covered by header checksums.
    ///
    /// The first four words are the address pair, which both the IP header
    /// checksum and the transport pseudo-header cover. The last two are the
    /// port pair, which only the transport checksum covers.
    #[must_use]
    pub fn checksum_words(&self) -> [u16; 6] {
        let s = self.saddr.octets();
        let d = self.daddr.octets();
        [
            u16::from_be_bytes([s[0], s[1]]),
            u16::from_be_bytes([s[2], s[3]]),
            u16::from_be_bytes([d[0], d[1]]),
            u16::from_be_bytes([d[2], d[3]]),
            self.sport,
            self.dport,
        ]
    }

    /// Extracts the flow identifier of a TCP or UDP packet.
    ///
    /// Returns `None` for packets without a network header, other
    /// protocols, non-initial fragments, and truncated transport headers.
    #[must_use]
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if !packet.has_network_header() || !packet.is_first_fragment() {
            return None;
        }
        let protocol = packet.ip_protocol();
        if !matches!(Protocol::from(protocol), Protocol::Tcp | Protocol::Udp)
            || packet.transport_len() < 4
        {
            return None;
        }
        Some(Self::new(
            packet.ip_src(),
            packet.transport_u16(0),
            packet.ip_dst(),
            packet.transport_u16(2),
            protocol,
        ))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.saddr, self.sport, self.daddr, self.dport
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(192, 168, 1, 100),
            12345,
            Ipv4Addr::new(8, 8, 8, 8),
            80,
            6,
        )
    }

    #[test]
    fn test_reverse() {
        let reverse = flow().reverse();
        assert_eq!(reverse.saddr, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(reverse.daddr, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(reverse.sport, 80);
        assert_eq!(reverse.dport, 12345);
        assert_eq!(reverse.protocol, 6);
        assert_eq!(reverse.reverse(), flow());
    }

    #[test]
    fn test_equality_covers_protocol() {
        let mut udp = flow();
        udp.protocol = 17;
        assert_ne!(udp, flow());
        assert_eq!(udp.transport(), Protocol::Udp);
    }

    #[test]
    fn test_checksum_words() {
        assert_eq!(
            flow().checksum_words(),
            [0xC0A8, 0x0164, 0x0808, 0x0808, 12345, 80]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(flow().to_string(), "(192.168.1.100, 12345, 8.8.8.8, 80)");
    }

    #[test]
    fn test_from_packet() {
        let mut data = vec![0u8; 40];
        data[0] = 0x45;
        data[9] = 6;
        data[12..16].copy_from_slice(&[192, 168, 1, 100]);
        data[16..20].copy_from_slice(&[8, 8, 8, 8]);
        data[20..22].copy_from_slice(&12345u16.to_be_bytes());
        data[22..24].copy_from_slice(&80u16.to_be_bytes());

        let pkt = Packet::from_ipv4(data.clone()).unwrap();
        assert_eq!(FlowId::from_packet(&pkt), Some(flow()));

        // Later fragments carry no ports.
        data[7] = 10;
        let frag = Packet::from_ipv4(data.clone()).unwrap();
        assert_eq!(FlowId::from_packet(&frag), None);

        // ICMP is not tracked.
        data[7] = 0;
        data[9] = 1;
        let icmp = Packet::from_ipv4(data).unwrap();
        assert_eq!(FlowId::from_packet(&icmp), None);

        assert_eq!(FlowId::from_packet(&Packet::new(vec![0; 40])), None);
    }
}
