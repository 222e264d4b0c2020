//! Rewritten flows.
//!
//! A [`Flow`] pairs the identifier a connection had before rewriting with
//! the identifier it has after, and knows how to turn a packet of either
//! direction into the other side's view. Everything that can be computed
//! once per flow (both endpoints, both checksum deltas) is computed at
//! construction so that [`Flow::apply`] is a handful of stores and two
//! add-with-carry operations.

use std::fmt::Write as _;

use bitflags::bitflags;

use super::checksum::{accumulate_delta, apply_delta};
use super::flowid::FlowId;
use super::{HZ, Jiffies};
use crate::datapath::{ANNO_SIZE, Packet, Protocol, TcpFlags};

/// Minimum TCP bytes needed to reach the checksum field.
const TCP_REWRITE_LEN: usize = 18;

/// Minimum UDP bytes (the full UDP header).
const UDP_REWRITE_LEN: usize = 8;

/// Offset of the TCP checksum within the TCP header.
const TCP_CHECKSUM_OFFSET: usize = 16;

/// Offset of the UDP checksum within the UDP header.
const UDP_CHECKSUM_OFFSET: usize = 6;

/// Packet direction relative to a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Original side towards the rewritten side.
    Forward,
    /// Rewritten side back towards the original side.
    Reply,
}

impl Direction {
    /// Returns the endpoint index for this direction.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Reply => 1,
        }
    }

    /// Returns true for the reply direction.
    #[inline]
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Reply)
    }

    /// Returns the other direction.
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Reply,
            Self::Reply => Self::Forward,
        }
    }
}

/// One side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEndpoint {
    flow_id: FlowId,
    output: usize,
    direction: Direction,
}

impl FlowEndpoint {
    const fn new(flow_id: FlowId, output: usize, direction: Direction) -> Self {
        Self {
            flow_id,
            output,
            direction,
        }
    }

    /// Returns the identifier packets carry on this side.
    #[inline]
    #[must_use]
    pub const fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Returns the output port packets on this side are sent to.
    #[inline]
    #[must_use]
    pub const fn output(&self) -> usize {
        self.output
    }

    /// Returns the direction this endpoint matches.
    #[inline]
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true for the reply endpoint.
    #[inline]
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.direction.is_reply()
    }
}

bitflags! {
    /// TCP teardown progress of a flow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SessionState: u8 {
        /// A FIN was seen in the forward direction.
        const FORWARD_CLOSING = 1 << 0;
        /// A FIN was seen in the reply direction.
        const REPLY_CLOSING = 1 << 1;
        /// Both sides are done, by FINs or a RST.
        const BOTH_CLOSED = Self::FORWARD_CLOSING.bits() | Self::REPLY_CLOSING.bits();
    }
}

impl SessionState {
    /// Returns the closing flag for `direction`.
    #[inline]
    #[must_use]
    pub const fn closing(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Self::FORWARD_CLOSING,
            Direction::Reply => Self::REPLY_CLOSING,
        }
    }
}

/// Packet annotations [`Flow::apply`] should update besides the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyAnnotations {
    /// Store the rewritten destination address in the destination-IP
    /// annotation.
    pub set_dst_ip: bool,
    /// In the reply direction, store the flow's reply annotation byte at
    /// this offset of the annotation area. Offsets past the area are
    /// ignored.
    pub reply_anno_offset: Option<usize>,
}

impl ApplyAnnotations {
    /// Updates no annotations.
    pub const NONE: Self = Self {
        set_dst_ip: false,
        reply_anno_offset: None,
    };

    /// Sets the destination-IP annotation.
    #[must_use]
    pub const fn with_dst_ip(mut self) -> Self {
        self.set_dst_ip = true;
        self
    }

    /// Stores the reply annotation byte at `offset` on reply packets.
    /// [`Flow::apply`] skips offsets outside the annotation area.
    #[must_use]
    pub const fn with_reply_anno(mut self, offset: usize) -> Self {
        self.reply_anno_offset = Some(offset);
        self
    }
}

/// The side of the flow table a flow needs for diagnostics.
pub trait FlowOwner {
    /// Name of the owning element.
    fn name(&self) -> &str;

    /// Name of the element that emits reply packets for flows created
    /// through input slot `input`.
    fn reply_element(&self, input: usize) -> &str;

    /// Expiry the owner will actually enforce for `flow`, which can differ
    /// from [`Flow::expiry`] for flows that are not guaranteed.
    fn effective_expiry(&self, flow: &Flow) -> Jiffies;
}

/// A bidirectional rewritten flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    endpoints: [FlowEndpoint; 2],
    ip_csum_delta: u16,
    transport_csum_delta: u16,
    state: SessionState,
    expiry: Jiffies,
    guaranteed: bool,
    reply_anno: u8,
    pub(super) heap_position: usize,
    owner_input: usize,
}

impl Flow {
    /// Creates a flow rewriting `flow_id` into `rewritten`.
    ///
    /// Forward packets leave through `output`, replies through
    /// `reply_output`. `owner_input` is the table input slot that created
    /// the flow.
    #[must_use]
    pub fn new(
        flow_id: FlowId,
        output: usize,
        rewritten: FlowId,
        reply_output: usize,
        guaranteed: bool,
        expiry: Jiffies,
        owner_input: usize,
    ) -> Self {
        let old = flow_id.checksum_words();
        let new = rewritten.checksum_words();

        let ip_csum_delta = old[..4]
            .iter()
            .zip(&new[..4])
            .fold(0, |delta, (&o, &n)| accumulate_delta(delta, o, n));
        let transport_csum_delta = old[4..]
            .iter()
            .zip(&new[4..])
            .fold(ip_csum_delta, |delta, (&o, &n)| accumulate_delta(delta, o, n));

        Self {
            endpoints: [
                FlowEndpoint::new(flow_id, output, Direction::Forward),
                FlowEndpoint::new(rewritten.reverse(), reply_output, Direction::Reply),
            ],
            ip_csum_delta,
            transport_csum_delta,
            state: SessionState::empty(),
            expiry,
            guaranteed,
            reply_anno: 0,
            heap_position: 0,
            owner_input,
        }
    }

    /// Returns the endpoint matching `direction`.
    #[inline]
    #[must_use]
    pub const fn endpoint(&self, direction: Direction) -> &FlowEndpoint {
        &self.endpoints[direction.index()]
    }

    /// Returns the original forward identifier.
    #[inline]
    #[must_use]
    pub const fn flow_id(&self) -> &FlowId {
        self.endpoints[0].flow_id()
    }

    /// Returns the forward identifier after rewriting.
    #[inline]
    #[must_use]
    pub const fn rewritten_flow_id(&self) -> FlowId {
        self.endpoints[1].flow_id.reverse()
    }

    /// Returns what a packet matching `direction` looks like after
    /// rewriting.
    #[inline]
    #[must_use]
    pub const fn rewritten_for(&self, direction: Direction) -> FlowId {
        self.endpoints[direction.opposite().index()].flow_id.reverse()
    }

    /// Returns the output port for packets matching `direction`.
    #[inline]
    #[must_use]
    pub const fn output(&self, direction: Direction) -> usize {
        self.endpoints[direction.index()].output
    }

    /// Returns the transport protocol of the flow.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.flow_id().transport()
    }

    /// Returns the IP header checksum delta.
    #[inline]
    #[must_use]
    pub const fn ip_checksum_delta(&self) -> u16 {
        self.ip_csum_delta
    }

    /// Returns the TCP/UDP checksum delta.
    #[inline]
    #[must_use]
    pub const fn transport_checksum_delta(&self) -> u16 {
        self.transport_csum_delta
    }

    /// Returns the TCP teardown state.
    #[inline]
    #[must_use]
    pub const fn session_state(&self) -> SessionState {
        self.state
    }

    /// Returns true once both sides have closed the session.
    #[inline]
    #[must_use]
    pub const fn session_over(&self) -> bool {
        self.state.contains(SessionState::BOTH_CLOSED)
    }

    /// Returns the expiry time.
    #[inline]
    #[must_use]
    pub const fn expiry(&self) -> Jiffies {
        self.expiry
    }

    pub(super) fn set_expiry(&mut self, expiry: Jiffies) {
        self.expiry = expiry;
    }

    /// Returns true if the flow may be reclaimed at `now`.
    #[inline]
    #[must_use]
    pub const fn expired(&self, now: Jiffies) -> bool {
        self.expiry <= now
    }

    /// Returns true if the flow must be kept until its expiry.
    #[inline]
    #[must_use]
    pub const fn guaranteed(&self) -> bool {
        self.guaranteed
    }

    pub(super) fn set_guaranteed(&mut self, guaranteed: bool) {
        self.guaranteed = guaranteed;
    }

    /// Returns the slot this flow occupies in its expiry heap.
    ///
    /// Meaningless once the flow has left the heap.
    #[inline]
    #[must_use]
    pub const fn heap_position(&self) -> usize {
        self.heap_position
    }

    /// Returns the table input slot that created this flow.
    #[inline]
    #[must_use]
    pub const fn owner_input(&self) -> usize {
        self.owner_input
    }

    /// Returns the annotation byte stamped on reply packets.
    #[inline]
    #[must_use]
    pub const fn reply_anno(&self) -> u8 {
        self.reply_anno
    }

    /// Sets the annotation byte stamped on reply packets.
    #[inline]
    pub fn set_reply_anno(&mut self, anno: u8) {
        self.reply_anno = anno;
    }

    /// Rewrites a packet of this flow in place.
    ///
    /// Addresses and ports are replaced by the opposite endpoint's view and
    /// checksums are patched with the precomputed deltas, added for forward
    /// packets and subtracted for replies. Non-initial fragments only get
    /// their IP header rewritten. A zero UDP checksum means "no checksum"
    /// and is preserved.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    pub fn apply(&mut self, packet: &mut Packet, direction: Direction, annos: ApplyAnnotations) {
        assert!(
            packet.has_network_header(),
            "cannot rewrite a packet without a network header"
        );
        let reply = direction.is_reply();
        let rev = self.endpoints[direction.opposite().index()].flow_id;

        // IP header
        packet.set_ip_src(rev.daddr);
        packet.set_ip_dst(rev.saddr);
        if annos.set_dst_ip {
            packet.set_dst_ip_anno(rev.saddr);
        }
        let reply_anno_offset = annos.reply_anno_offset.filter(|&o| o < ANNO_SIZE);
        if let (true, Some(offset)) = (reply, reply_anno_offset) {
            packet.set_anno_u8(offset, self.reply_anno);
        }
        let ip_sum = apply_delta(packet.ip_checksum(), self.ip_csum_delta, reply);
        packet.set_ip_checksum(ip_sum);

        if !packet.is_first_fragment() {
            return;
        }

        match Protocol::from(packet.ip_protocol()) {
            Protocol::Tcp if packet.transport_len() >= TCP_REWRITE_LEN => {
                packet.set_transport_u16(0, rev.dport);
                packet.set_transport_u16(2, rev.sport);
                let sum = apply_delta(
                    packet.transport_u16(TCP_CHECKSUM_OFFSET),
                    self.transport_csum_delta,
                    reply,
                );
                packet.set_transport_u16(TCP_CHECKSUM_OFFSET, sum);

                let flags = packet.tcp_flags().unwrap_or_default();
                if flags.contains(TcpFlags::RST) {
                    self.state |= SessionState::BOTH_CLOSED;
                } else if flags.contains(TcpFlags::FIN) {
                    self.state |= SessionState::closing(direction);
                } else if flags.contains(TcpFlags::SYN) {
                    self.state -= SessionState::closing(direction);
                }
            }
            Protocol::Udp if packet.transport_len() >= UDP_REWRITE_LEN => {
                packet.set_transport_u16(0, rev.dport);
                packet.set_transport_u16(2, rev.sport);
                let old = packet.transport_u16(UDP_CHECKSUM_OFFSET);
                if old != 0 {
                    let sum = apply_delta(old, self.transport_csum_delta, reply);
                    // A computed zero is transmitted as all ones.
                    let sum = if sum == 0 { 0xFFFF } else { sum };
                    packet.set_transport_u16(UDP_CHECKSUM_OFFSET, sum);
                }
            }
            _ => {}
        }
    }

    /// Renders this flow as seen from `direction`.
    ///
    /// The line reads `id => rewritten [out out] iN expS`.
    #[must_use]
    pub fn unparse<O: FlowOwner + ?Sized>(
        &self,
        owner: &O,
        direction: Direction,
        now: Jiffies,
    ) -> String {
        let mut line = format!(
            "{} => {}",
            self.endpoint(direction).flow_id(),
            self.rewritten_for(direction)
        );
        self.unparse_ports(&mut line, owner, direction, now);
        line
    }

    /// Appends the output ports, input slot and seconds until expiry.
    ///
    /// The output belonging to `direction` is marked with `*`. The other one
    /// is prefixed with the name of the element that emits it when that is
    /// not the owner itself.
    pub fn unparse_ports<O: FlowOwner + ?Sized>(
        &self,
        out: &mut String,
        owner: &O,
        direction: Direction,
        now: Jiffies,
    ) {
        let reply_element = owner.reply_element(self.owner_input);
        let foreign = reply_element != owner.name();

        out.push_str(" [");
        if !direction.is_reply() {
            out.push('*');
        } else if foreign {
            let _ = write!(out, "{}:", owner.name());
        }
        let _ = write!(out, "{} ", self.endpoints[0].output);
        if direction.is_reply() {
            out.push('*');
        } else if foreign {
            let _ = write!(out, "{reply_element}:");
        }

        let expiry = if self.guaranteed {
            self.expiry
        } else {
            owner.effective_expiry(self)
        };
        let remaining =
            (i128::from(expiry) + i128::from(HZ / 2) - i128::from(now)) / i128::from(HZ);
        let _ = write!(
            out,
            "{}] i{} exp{}",
            self.endpoints[1].output, self.owner_input, remaining
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::rewriter::checksum::{ipv4_header_checksum, tcp_checksum, udp_checksum};

    struct Owner {
        reply: &'static str,
    }

    impl FlowOwner for Owner {
        fn name(&self) -> &str {
            "rw"
        }

        fn reply_element(&self, _input: usize) -> &str {
            self.reply
        }

        fn effective_expiry(&self, flow: &Flow) -> Jiffies {
            flow.expiry() + 10 * HZ
        }
    }

    fn original() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(192, 168, 1, 100),
            12345,
            Ipv4Addr::new(8, 8, 8, 8),
            80,
            6,
        )
    }

    fn rewritten() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(10, 0, 0, 1),
            54321,
            Ipv4Addr::new(8, 8, 8, 8),
            80,
            6,
        )
    }

    fn tcp_flow() -> Flow {
        Flow::new(original(), 0, rewritten(), 1, true, 5 * HZ, 0)
    }

    /// Builds an IPv4 packet for `id` with valid checksums.
    fn build(id: &FlowId, flags: u8) -> Packet {
        let transport_len = if id.protocol == 6 { 20 } else { 8 };
        let mut data = vec![0u8; 20 + transport_len + 4];
        let total = u16::try_from(data.len()).unwrap();
        data[0] = 0x45;
        data[2..4].copy_from_slice(&total.to_be_bytes());
        data[8] = 64;
        data[9] = id.protocol;
        data[12..16].copy_from_slice(&id.saddr.octets());
        data[16..20].copy_from_slice(&id.daddr.octets());
        data[20..22].copy_from_slice(&id.sport.to_be_bytes());
        data[22..24].copy_from_slice(&id.dport.to_be_bytes());
        if id.protocol == 6 {
            data[40..].copy_from_slice(b"data");
            data[32] = 0x50;
            data[33] = flags;
            let sum = tcp_checksum(id.saddr.octets(), id.daddr.octets(), &data[20..]);
            data[36..38].copy_from_slice(&sum.to_be_bytes());
        } else {
            let udp_len = u16::try_from(transport_len + 4).unwrap();
            data[24..26].copy_from_slice(&udp_len.to_be_bytes());
            data[28..].copy_from_slice(b"data");
            let sum = udp_checksum(id.saddr.octets(), id.daddr.octets(), &data[20..]);
            data[26..28].copy_from_slice(&sum.to_be_bytes());
        }
        let ip_sum = ipv4_header_checksum(&data[..20]);
        data[10..12].copy_from_slice(&ip_sum.to_be_bytes());
        Packet::from_ipv4(data).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let flow = tcp_flow();
        assert_eq!(flow.endpoint(Direction::Forward).flow_id(), &original());
        assert_eq!(flow.endpoint(Direction::Reply).flow_id(), &rewritten().reverse());
        assert!(!flow.endpoint(Direction::Forward).is_reply());
        assert!(flow.endpoint(Direction::Reply).is_reply());
        assert_eq!(flow.output(Direction::Forward), 0);
        assert_eq!(flow.output(Direction::Reply), 1);
        assert_eq!(flow.rewritten_flow_id(), rewritten());
        assert_eq!(flow.rewritten_for(Direction::Reply), original().reverse());
        assert_eq!(flow.protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_forward_rewrite_matches_full_checksum() {
        let mut flow = tcp_flow();
        let mut pkt = build(&original(), 0x10);
        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);

        let expected = build(&rewritten(), 0x10);
        assert_eq!(pkt.data(), expected.data());
    }

    #[test]
    fn test_reply_rewrite_matches_full_checksum() {
        let mut flow = tcp_flow();
        let mut pkt = build(&rewritten().reverse(), 0x10);
        flow.apply(&mut pkt, Direction::Reply, ApplyAnnotations::NONE);

        let expected = build(&original().reverse(), 0x10);
        assert_eq!(pkt.data(), expected.data());
    }

    #[test]
    fn test_udp_rewrite_matches_full_checksum() {
        let orig = FlowId { protocol: 17, ..original() };
        let rw = FlowId { protocol: 17, ..rewritten() };
        let mut flow = Flow::new(orig, 0, rw, 1, false, 0, 0);

        let mut pkt = build(&orig, 0);
        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);
        assert_eq!(pkt.data(), build(&rw, 0).data());
    }

    #[test]
    fn test_udp_zero_checksum_preserved() {
        let orig = FlowId { protocol: 17, ..original() };
        let rw = FlowId { protocol: 17, ..rewritten() };
        let mut flow = Flow::new(orig, 0, rw, 1, false, 0, 0);

        let mut pkt = build(&orig, 0);
        pkt.set_transport_u16(UDP_CHECKSUM_OFFSET, 0);
        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);

        assert_eq!(pkt.transport_u16(UDP_CHECKSUM_OFFSET), 0);
        assert_eq!(pkt.ip_src(), rw.saddr);
        assert_eq!(pkt.transport_u16(0), rw.sport);
    }

    #[test]
    fn test_non_initial_fragment_keeps_transport() {
        let mut flow = tcp_flow();
        let mut pkt = build(&original(), 0x01);
        // Mark as fragment at offset 8 bytes and fix the IP checksum.
        pkt.data_mut()[7] = 1;
        pkt.data_mut()[10..12].copy_from_slice(&[0, 0]);
        let sum = ipv4_header_checksum(&pkt.data()[..20]);
        pkt.set_ip_checksum(sum);
        let transport_before = pkt.data()[20..].to_vec();

        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);

        assert_eq!(pkt.ip_src(), rewritten().saddr);
        assert_eq!(&pkt.data()[20..], transport_before.as_slice());
        assert!(flow.session_state().is_empty());

        let mut header = pkt.data()[..20].to_vec();
        header[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(pkt.ip_checksum(), ipv4_header_checksum(&header));
    }

    #[test]
    fn test_short_tcp_only_rewrites_ip() {
        let mut flow = tcp_flow();
        let mut data = build(&original(), 0).into_inner();
        data.truncate(20 + 17);
        let mut pkt = Packet::from_ipv4(data).unwrap();
        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);
        assert_eq!(pkt.ip_src(), rewritten().saddr);
        assert_eq!(pkt.transport_u16(0), original().sport);
    }

    #[test]
    fn test_session_state_fin_then_rst() {
        let mut flow = tcp_flow();
        let mut fin = build(&original(), 0x11);
        flow.apply(&mut fin, Direction::Forward, ApplyAnnotations::NONE);
        assert!(flow.session_state().contains(SessionState::FORWARD_CLOSING));
        assert!(!flow.session_state().contains(SessionState::REPLY_CLOSING));
        assert!(!flow.session_over());

        let mut rst = build(&rewritten().reverse(), 0x04);
        flow.apply(&mut rst, Direction::Reply, ApplyAnnotations::NONE);
        assert!(flow.session_state().contains(SessionState::BOTH_CLOSED));
        assert!(flow.session_over());
    }

    #[test]
    fn test_session_state_fins_both_ways() {
        let mut flow = tcp_flow();
        flow.apply(&mut build(&original(), 0x11), Direction::Forward, ApplyAnnotations::NONE);
        flow.apply(
            &mut build(&rewritten().reverse(), 0x11),
            Direction::Reply,
            ApplyAnnotations::NONE,
        );
        assert!(flow.session_over());
    }

    #[test]
    fn test_syn_reopens_direction() {
        let mut flow = tcp_flow();
        flow.apply(&mut build(&original(), 0x01), Direction::Forward, ApplyAnnotations::NONE);
        flow.apply(
            &mut build(&rewritten().reverse(), 0x01),
            Direction::Reply,
            ApplyAnnotations::NONE,
        );
        assert!(flow.session_over());

        flow.apply(&mut build(&original(), 0x02), Direction::Forward, ApplyAnnotations::NONE);
        assert_eq!(flow.session_state(), SessionState::REPLY_CLOSING);
    }

    #[test]
    fn test_annotations() {
        let mut flow = tcp_flow();
        flow.set_reply_anno(0x5A);
        let annos = ApplyAnnotations::NONE.with_dst_ip().with_reply_anno(3);

        let mut fwd = build(&original(), 0x10);
        flow.apply(&mut fwd, Direction::Forward, annos);
        assert_eq!(fwd.dst_ip_anno(), Some(rewritten().daddr));
        assert_eq!(fwd.anno_u8(3), 0);

        let mut rep = build(&rewritten().reverse(), 0x10);
        flow.apply(&mut rep, Direction::Reply, annos);
        assert_eq!(rep.dst_ip_anno(), Some(original().saddr));
        assert_eq!(rep.anno_u8(3), 0x5A);
    }

    #[test]
    fn test_out_of_range_reply_anno_ignored() {
        let mut flow = tcp_flow();
        flow.set_reply_anno(0x5A);
        let annos = ApplyAnnotations::NONE.with_reply_anno(ANNO_SIZE + 16);

        let mut rep = build(&rewritten().reverse(), 0x10);
        flow.apply(&mut rep, Direction::Reply, annos);
        assert_eq!(rep.data(), build(&original().reverse(), 0x10).data());
        assert!((0..ANNO_SIZE).all(|offset| rep.anno_u8(offset) == 0));
    }

    #[test]
    #[should_panic(expected = "without a network header")]
    fn test_apply_without_header_panics() {
        let mut flow = tcp_flow();
        let mut pkt = Packet::new(vec![0; 40]);
        flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);
    }

    #[test]
    fn test_unparse_forward() {
        let flow = tcp_flow();
        let owner = Owner { reply: "rw" };
        assert_eq!(
            flow.unparse(&owner, Direction::Forward, 2 * HZ),
            "(192.168.1.100, 12345, 8.8.8.8, 80) => (10.0.0.1, 54321, 8.8.8.8, 80) [*0 1] i0 exp3"
        );
    }

    #[test]
    fn test_unparse_reply_with_foreign_reply_element() {
        let flow = tcp_flow();
        let owner = Owner { reply: "mapper" };
        assert_eq!(
            flow.unparse(&owner, Direction::Reply, 2 * HZ),
            "(8.8.8.8, 80, 10.0.0.1, 54321) => (8.8.8.8, 80, 192.168.1.100, 12345) [rw:0 *1] i0 exp3"
        );
        assert!(flow
            .unparse(&owner, Direction::Forward, 0)
            .ends_with("[*0 mapper:1] i0 exp5"));
    }

    #[test]
    fn test_unparse_best_effort_uses_owner_expiry() {
        let flow = Flow::new(original(), 0, rewritten(), 1, false, 5 * HZ, 2);
        let owner = Owner { reply: "rw" };
        let line = flow.unparse(&owner, Direction::Forward, 20 * HZ);
        // Seconds round towards zero once the flow is overdue.
        assert!(line.ends_with("] i2 exp-4"), "{line}");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn flow_id(protocol: u8) -> impl Strategy<Value = FlowId> {
            (any::<[u8; 4]>(), any::<u16>(), any::<[u8; 4]>(), any::<u16>()).prop_map(
                move |(s, sport, d, dport)| {
                    FlowId::new(Ipv4Addr::from(s), sport, Ipv4Addr::from(d), dport, protocol)
                },
            )
        }

        fn flow_pair() -> impl Strategy<Value = (FlowId, FlowId)> {
            prop_oneof![Just(6u8), Just(17u8)]
                .prop_flat_map(|protocol| (flow_id(protocol), flow_id(protocol)))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn rewrite_equals_rebuilt_packet((orig, rw) in flow_pair()) {
                let mut flow = Flow::new(orig, 0, rw, 1, true, 0, 0);

                let mut fwd = build(&orig, 0x10);
                flow.apply(&mut fwd, Direction::Forward, ApplyAnnotations::NONE);
                let expected_fwd = build(&rw, 0x10);
                prop_assert_eq!(fwd.data(), expected_fwd.data());

                let mut rep = build(&rw.reverse(), 0x10);
                flow.apply(&mut rep, Direction::Reply, ApplyAnnotations::NONE);
                let expected_rep = build(&orig.reverse(), 0x10);
                prop_assert_eq!(rep.data(), expected_rep.data());
            }

            #[test]
            fn reply_undoes_forward((orig, rw) in flow_pair()) {
                let mut flow = Flow::new(orig, 0, rw, 1, true, 0, 0);
                let before = build(&orig, 0x10);

                let mut pkt = before.clone();
                flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);
                mirror(&mut pkt);
                flow.apply(&mut pkt, Direction::Reply, ApplyAnnotations::NONE);
                mirror(&mut pkt);

                prop_assert_eq!(pkt.data(), before.data());
            }

            #[test]
            fn forward_undoes_reply((orig, rw) in flow_pair()) {
                let mut flow = Flow::new(orig, 0, rw, 1, true, 0, 0);
                let before = build(&rw.reverse(), 0x10);

                let mut pkt = before.clone();
                flow.apply(&mut pkt, Direction::Reply, ApplyAnnotations::NONE);
                mirror(&mut pkt);
                flow.apply(&mut pkt, Direction::Forward, ApplyAnnotations::NONE);
                mirror(&mut pkt);

                prop_assert_eq!(pkt.data(), before.data());
            }
        }

        /// Swaps addresses and ports, turning a packet into its reply.
        fn mirror(pkt: &mut Packet) {
            let (src, dst) = (pkt.ip_src(), pkt.ip_dst());
            pkt.set_ip_src(dst);
            pkt.set_ip_dst(src);
            let (sport, dport) = (pkt.transport_u16(0), pkt.transport_u16(2));
            pkt.set_transport_u16(0, dport);
            pkt.set_transport_u16(2, sport);
        }
    }
}
