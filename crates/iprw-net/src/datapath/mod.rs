//! Packet buffers handed to the rewriter.
//!
//! Packets arrive here already received and framed; this module only knows
//! how to locate and patch IPv4, TCP and UDP header fields in place.

pub mod packet;

pub use packet::{
    ANNO_SIZE, ETHERNET_HEADER_LEN, ETHERTYPE_IPV4, IPV4_MIN_HEADER_LEN, Packet, Protocol,
    TcpFlags,
};
