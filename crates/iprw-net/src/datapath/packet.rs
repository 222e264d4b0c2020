//! Writable packet representation.
//!
//! A [`Packet`] owns its bytes and records where the IPv4 header starts, so
//! the rewriter can patch addresses, ports and checksums in place without
//! re-parsing. It also carries the two annotations the rewriter may set: the
//! destination-IP annotation used by downstream routing, and a small
//! user annotation area.

use std::net::Ipv4Addr;

use bitflags::bitflags;

use crate::error::{Result, RewriteError};

/// Length of an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Minimum IPv4 header length.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Size of the user annotation area carried by each packet.
pub const ANNO_SIZE: usize = 48;

/// Fragment offset mask of the IPv4 flags/fragment field.
const IP_OFFMASK: u16 = 0x1FFF;

/// Network protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Protocol {
    /// Unknown or unsupported protocol.
    #[default]
    Unknown = 0,
    /// Internet Control Message Protocol.
    Icmp = 1,
    /// Transmission Control Protocol.
    Tcp = 6,
    /// User Datagram Protocol.
    Udp = 17,
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            _ => Self::Unknown,
        }
    }
}

bitflags! {
    /// TCP header flags (byte 13 of the TCP header).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const _ = !0;
    }
}

/// A writable packet with an optional parsed IPv4 header.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet bytes.
    data: Vec<u8>,
    /// Offset of the IPv4 header, if one has been located.
    network_offset: Option<usize>,
    /// Destination address annotation.
    dst_ip_anno: Option<Ipv4Addr>,
    /// User annotation area.
    anno: [u8; ANNO_SIZE],
}

impl Packet {
    /// Creates a packet without a network header.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            network_offset: None,
            dst_ip_anno: None,
            anno: [0; ANNO_SIZE],
        }
    }

    /// Creates a packet whose data starts with an IPv4 header.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not start with a valid IPv4 header.
    pub fn from_ipv4(data: Vec<u8>) -> Result<Self> {
        let mut packet = Self::new(data);
        packet.set_network_header(0)?;
        Ok(packet)
    }

    /// Creates a packet whose data starts with an Ethernet II header
    /// carrying IPv4.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too short, is not IPv4, or carries
    /// an invalid IPv4 header.
    pub fn from_ethernet(data: Vec<u8>) -> Result<Self> {
        if data.len() < ETHERNET_HEADER_LEN {
            return Err(RewriteError::packet("frame shorter than Ethernet header"));
        }
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        if ethertype != ETHERTYPE_IPV4 {
            return Err(RewriteError::packet(format!(
                "unsupported EtherType {ethertype:#06x}"
            )));
        }
        let mut packet = Self::new(data);
        packet.set_network_header(ETHERNET_HEADER_LEN)?;
        Ok(packet)
    }

    /// Marks `offset` as the start of the IPv4 header.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no complete IPv4 header at `offset`.
    pub fn set_network_header(&mut self, offset: usize) -> Result<()> {
        if self.data.len() < offset + IPV4_MIN_HEADER_LEN {
            return Err(RewriteError::packet("packet too short for IPv4 header"));
        }
        let version_ihl = self.data[offset];
        if version_ihl >> 4 != 4 {
            return Err(RewriteError::packet(format!(
                "not an IPv4 header (version {})",
                version_ihl >> 4
            )));
        }
        let ihl = usize::from(version_ihl & 0x0F) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || offset + ihl > self.data.len() {
            return Err(RewriteError::packet(format!("invalid IPv4 header length {ihl}")));
        }
        self.network_offset = Some(offset);
        Ok(())
    }

    /// Returns true if a network header has been located.
    #[inline]
    #[must_use]
    pub const fn has_network_header(&self) -> bool {
        self.network_offset.is_some()
    }

    /// Returns the offset of the network header.
    #[inline]
    #[must_use]
    pub const fn network_offset(&self) -> Option<usize> {
        self.network_offset
    }

    /// Returns the packet length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the packet holds no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the packet data.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the packet data mutably.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the packet and returns its bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    fn l3(&self) -> usize {
        match self.network_offset {
            Some(offset) => offset,
            None => panic!("packet has no network header"),
        }
    }

    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    #[inline]
    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_ipv4(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        )
    }

    /// Returns the IPv4 header length in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn ip_header_len(&self) -> usize {
        usize::from(self.data[self.l3()] & 0x0F) * 4
    }

    /// Returns the IPv4 protocol number.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn ip_protocol(&self) -> u8 {
        self.data[self.l3() + 9]
    }

    /// Returns the IPv4 header checksum field.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn ip_checksum(&self) -> u16 {
        self.read_u16(self.l3() + 10)
    }

    /// Sets the IPv4 header checksum field.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    pub fn set_ip_checksum(&mut self, checksum: u16) {
        let l3 = self.l3();
        self.write_u16(l3 + 10, checksum);
    }

    /// Returns the IPv4 source address.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn ip_src(&self) -> Ipv4Addr {
        self.read_ipv4(self.l3() + 12)
    }

    /// Sets the IPv4 source address. The checksum is left alone.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    pub fn set_ip_src(&mut self, addr: Ipv4Addr) {
        let l3 = self.l3();
        self.data[l3 + 12..l3 + 16].copy_from_slice(&addr.octets());
    }

    /// Returns the IPv4 destination address.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn ip_dst(&self) -> Ipv4Addr {
        self.read_ipv4(self.l3() + 16)
    }

    /// Sets the IPv4 destination address. The checksum is left alone.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    pub fn set_ip_dst(&mut self, addr: Ipv4Addr) {
        let l3 = self.l3();
        self.data[l3 + 16..l3 + 20].copy_from_slice(&addr.octets());
    }

    /// Returns the fragment offset in 8-byte units.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn fragment_offset(&self) -> u16 {
        self.read_u16(self.l3() + 6) & IP_OFFMASK
    }

    /// Returns true unless this is a non-initial fragment.
    ///
    /// Only the first fragment of a datagram carries the transport header.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn is_first_fragment(&self) -> bool {
        self.fragment_offset() == 0
    }

    /// Returns the offset of the transport header.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn transport_offset(&self) -> usize {
        self.l3() + self.ip_header_len()
    }

    /// Returns the number of bytes from the transport header to the end of
    /// the packet.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn transport_len(&self) -> usize {
        self.data.len().saturating_sub(self.transport_offset())
    }

    /// Reads a 16-bit word at `offset` bytes into the transport header.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header or the word lies past the
    /// end of the packet.
    #[must_use]
    pub fn transport_u16(&self, offset: usize) -> u16 {
        self.read_u16(self.transport_offset() + offset)
    }

    /// Writes a 16-bit word at `offset` bytes into the transport header.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header or the word lies past the
    /// end of the packet.
    pub fn set_transport_u16(&mut self, offset: usize, value: u16) {
        let l4 = self.transport_offset();
        self.write_u16(l4 + offset, value);
    }

    /// Returns the TCP flags, if this is a TCP packet long enough to carry
    /// them.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    #[must_use]
    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        if Protocol::from(self.ip_protocol()) != Protocol::Tcp || self.transport_len() < 14 {
            return None;
        }
        Some(TcpFlags::from_bits_retain(
            self.data[self.transport_offset() + 13],
        ))
    }

    /// Returns the destination-IP annotation.
    #[inline]
    #[must_use]
    pub const fn dst_ip_anno(&self) -> Option<Ipv4Addr> {
        self.dst_ip_anno
    }

    /// Sets the destination-IP annotation.
    #[inline]
    pub fn set_dst_ip_anno(&mut self, addr: Ipv4Addr) {
        self.dst_ip_anno = Some(addr);
    }

    /// Returns the annotation byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= ANNO_SIZE`.
    #[inline]
    #[must_use]
    pub fn anno_u8(&self, offset: usize) -> u8 {
        self.anno[offset]
    }

    /// Sets the annotation byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= ANNO_SIZE`.
    #[inline]
    pub fn set_anno_u8(&mut self, offset: usize, value: u8) {
        self.anno[offset] = value;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("network_offset", &self.network_offset)
            .field("dst_ip_anno", &self.dst_ip_anno)
            .finish_non_exhaustive()
    }
}
