//! Stateful flow rewriting.
//!
//! The rewriter translates the addresses and ports of TCP and UDP flows in
//! both directions, patching checksums incrementally instead of recomputing
//! them.
//!
//! # Architecture
//!
//! ```text
//!            packet ──► FlowId::from_packet ──► FlowTable::lookup
//!                                                   │
//!                              ┌────────────────────┴──────────┐
//!                              ▼                               ▼
//!                       Flow::apply (headers,         ExpiryHeap::change_expiry
//!                       checksum deltas,              (best-effort / guaranteed
//!                       TCP teardown state)            min-heaps)
//!                              │                               │
//!                              ▼                               ▼
//!                        output port                  FlowTable::gc / eviction
//!                                                         └─► destroy
//! ```
//!
//! Time is passed explicitly as [`Jiffies`], a monotonic tick count with
//! [`HZ`] ticks per second.

pub mod arena;
pub mod checksum;
pub mod flow;
pub mod flowid;
pub mod heap;
pub mod table;

use serde::{Deserialize, Serialize};

use crate::datapath::{ANNO_SIZE, Protocol};
use crate::error::{Result, RewriteError};

pub use arena::{FlowArena, FlowHandle};
pub use flow::{ApplyAnnotations, Direction, Flow, FlowEndpoint, FlowOwner, SessionState};
pub use flowid::FlowId;
pub use heap::ExpiryHeap;
pub use table::{FlowTable, InputSpec, TableStats};

/// Monotonic time in ticks.
pub type Jiffies = u64;

/// Ticks per second.
pub const HZ: Jiffies = 1000;

/// Converts whole seconds to ticks.
#[inline]
#[must_use]
pub const fn secs_to_jiffies(secs: u64) -> Jiffies {
    secs.saturating_mul(HZ)
}

/// Default flow table capacity.
pub const DEFAULT_CAPACITY: usize = 65536;

/// Flow rewriter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterConfig {
    /// Element name shown in diagnostics.
    pub name: String,
    /// Maximum number of live flows.
    pub capacity: usize,
    /// Best-effort lifetime of an idle TCP flow.
    pub tcp_timeout_secs: u64,
    /// Lifetime of a TCP flow once both sides have closed.
    pub tcp_done_timeout_secs: u64,
    /// Best-effort lifetime of an idle UDP flow.
    pub udp_timeout_secs: u64,
    /// How long an active flow is guaranteed to survive. 0 disables
    /// guarantees.
    pub guarantee_secs: u64,
    /// Store the rewritten destination in the destination-IP annotation.
    pub set_dst_ip_anno: bool,
    /// Annotation offset that receives a flow's reply annotation byte.
    pub reply_anno_offset: Option<usize>,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            name: "rewriter".to_string(),
            capacity: DEFAULT_CAPACITY,
            tcp_timeout_secs: 86400,
            tcp_done_timeout_secs: 240,
            udp_timeout_secs: 300,
            guarantee_secs: 5,
            set_dst_ip_anno: true,
            reply_anno_offset: None,
        }
    }
}

impl RewriterConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the element name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the flow capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the TCP idle and closed timeouts.
    #[must_use]
    pub const fn with_tcp_timeouts(mut self, timeout_secs: u64, done_timeout_secs: u64) -> Self {
        self.tcp_timeout_secs = timeout_secs;
        self.tcp_done_timeout_secs = done_timeout_secs;
        self
    }

    /// Sets the UDP idle timeout.
    #[must_use]
    pub const fn with_udp_timeout(mut self, timeout_secs: u64) -> Self {
        self.udp_timeout_secs = timeout_secs;
        self
    }

    /// Sets the guarantee period.
    #[must_use]
    pub const fn with_guarantee(mut self, guarantee_secs: u64) -> Self {
        self.guarantee_secs = guarantee_secs;
        self
    }

    /// Enables or disables the destination-IP annotation.
    #[must_use]
    pub const fn with_dst_ip_anno(mut self, enabled: bool) -> Self {
        self.set_dst_ip_anno = enabled;
        self
    }

    /// Sets the reply annotation offset.
    #[must_use]
    pub const fn with_reply_anno_offset(mut self, offset: usize) -> Self {
        self.reply_anno_offset = Some(offset);
        self
    }

    /// Checks the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero capacity, a zero best-effort
    /// timeout, a guarantee longer than a best-effort timeout, or an
    /// annotation offset outside the annotation area.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RewriteError::config("capacity must be non-zero"));
        }
        if self.tcp_timeout_secs == 0 || self.tcp_done_timeout_secs == 0 || self.udp_timeout_secs == 0 {
            return Err(RewriteError::config("timeouts must be non-zero"));
        }
        let shortest = self
            .tcp_timeout_secs
            .min(self.tcp_done_timeout_secs)
            .min(self.udp_timeout_secs);
        if self.guarantee_secs > shortest {
            return Err(RewriteError::config(format!(
                "guarantee of {}s exceeds the {}s timeout",
                self.guarantee_secs, shortest
            )));
        }
        if let Some(offset) = self.reply_anno_offset {
            if offset >= ANNO_SIZE {
                return Err(RewriteError::config(format!(
                    "reply annotation offset {offset} outside {ANNO_SIZE}-byte area"
                )));
            }
        }
        Ok(())
    }

    /// Returns the annotations rewritten packets receive.
    #[must_use]
    pub const fn annotations(&self) -> ApplyAnnotations {
        ApplyAnnotations {
            set_dst_ip: self.set_dst_ip_anno,
            reply_anno_offset: self.reply_anno_offset,
        }
    }

    /// Returns the guarantee period in ticks.
    #[must_use]
    pub const fn guarantee(&self) -> Jiffies {
        secs_to_jiffies(self.guarantee_secs)
    }

    /// Returns the best-effort timeout in ticks for a flow of `protocol`,
    /// using the closed timeout for finished TCP sessions.
    #[must_use]
    pub const fn best_effort_timeout(&self, protocol: Protocol, session_over: bool) -> Jiffies {
        let secs = match protocol {
            Protocol::Tcp if session_over => self.tcp_done_timeout_secs,
            Protocol::Tcp => self.tcp_timeout_secs,
            _ => self.udp_timeout_secs,
        };
        secs_to_jiffies(secs)
    }
}
