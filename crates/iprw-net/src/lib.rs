//! # iprw-net
//!
//! Stateful IPv4 flow rewriting.
//!
//! This crate translates TCP and UDP flows in both directions, the core of
//! NAT-style address and port rewriting:
//!
//! - **Flows**: bidirectional mappings with precomputed checksum deltas
//! - **Incremental checksums**: one add-with-carry per checksum field
//! - **TCP teardown tracking**: FIN/RST bookkeeping decides when a flow is done
//! - **Expiry heaps**: guaranteed and best-effort flows, reclaimed in order
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    iprw-net                     │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │               FlowTable                 │   │
//! │  │  - FlowId index (both directions)       │   │
//! │  │  - input slots, capacity, gc            │   │
//! │  └─────────────────────────────────────────┘   │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐   │
//! │  │   Flow   │ │  Expiry  │ │   Checksum   │   │
//! │  │  apply   │ │   Heap   │ │    deltas    │   │
//! │  └──────────┘ └──────────┘ └──────────────┘   │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │            datapath::Packet             │   │
//! │  └─────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::net::Ipv4Addr;
//!
//! use iprw_net::rewriter::{FlowId, FlowTable, RewriterConfig};
//!
//! let mut table = FlowTable::new(RewriterConfig::new().with_name("nat"))?;
//! let input = table.add_input(0, 1, None);
//!
//! let inside = FlowId::new(Ipv4Addr::new(192, 168, 1, 10), 5353, Ipv4Addr::new(8, 8, 8, 8), 53, 17);
//! let outside = FlowId::new(Ipv4Addr::new(203, 0, 113, 1), 61000, Ipv4Addr::new(8, 8, 8, 8), 53, 17);
//! table.create(inside, outside, input, 0)?;
//!
//! assert!(table.lookup(&outside.reverse()).is_some());
//! # Ok::<(), iprw_net::RewriteError>(())
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod datapath;
pub mod error;
pub mod rewriter;

pub use error::{Result, RewriteError};
