//! Flow table.
//!
//! [`FlowTable`] owns every live [`Flow`]: it indexes both directions of
//! each flow by [`FlowId`], keeps the flows ordered for expiry in an
//! [`ExpiryHeap`], counts flows per input slot, and reclaims flows when
//! they expire or when room is needed for a new one.
//!
//! The table is single-threaded. Hosts that process packets on several
//! threads should shard tables per thread or wrap one in a single lock.

use std::fmt;

use hashbrown::HashMap;
use iprw_error::CommonError;
use serde::Serialize;

use super::arena::{FlowArena, FlowHandle};
use super::flow::{Direction, Flow, FlowOwner};
use super::flowid::FlowId;
use super::heap::ExpiryHeap;
use super::{Jiffies, RewriterConfig};
use crate::datapath::Packet;
use crate::error::{Result, RewriteError};

/// An input slot: where flows created through it send their packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    /// Output port for forward packets.
    pub foutput: usize,
    /// Output port for reply packets.
    pub routput: usize,
    /// Name of the element that emits reply packets.
    pub reply_element: String,
    /// Number of live flows created through this slot.
    pub count: usize,
}

/// Flow table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Flows created.
    pub created: u64,
    /// Flows destroyed for any reason.
    pub destroyed: u64,
    /// Flows destroyed because they expired.
    pub expired: u64,
    /// Best-effort flows destroyed early to make room.
    pub evicted: u64,
    /// Flow creations refused because the table was full.
    pub refused: u64,
    /// Packets rewritten.
    pub rewritten: u64,
    /// Guaranteed flows moved to best-effort after their guarantee lapsed.
    pub demoted: u64,
}

/// Table of rewritten flows.
pub struct FlowTable {
    config: RewriterConfig,
    arena: FlowArena,
    heap: ExpiryHeap,
    /// Both directions of every flow.
    map: HashMap<FlowId, (FlowHandle, Direction)>,
    inputs: Vec<InputSpec>,
    stats: TableStats,
}

impl FlowTable {
    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: RewriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            arena: FlowArena::with_capacity(config.capacity.min(4096)),
            heap: ExpiryHeap::new(),
            map: HashMap::new(),
            inputs: Vec::new(),
            stats: TableStats::default(),
            config,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RewriterConfig {
        &self.config
    }

    /// Returns the number of live flows.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.arena.len()
    }

    /// Returns true if no flows are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Returns statistics.
    #[must_use]
    pub const fn stats(&self) -> &TableStats {
        &self.stats
    }

    /// Returns the expiry heaps.
    #[must_use]
    pub const fn heap(&self) -> &ExpiryHeap {
        &self.heap
    }

    /// Adds an input slot and returns its index.
    ///
    /// Reply packets are attributed to `reply_element`, or to this table
    /// when `None`.
    pub fn add_input(&mut self, foutput: usize, routput: usize, reply_element: Option<&str>) -> usize {
        self.inputs.push(InputSpec {
            foutput,
            routput,
            reply_element: reply_element.unwrap_or(self.config.name.as_str()).to_string(),
            count: 0,
        });
        self.inputs.len() - 1
    }

    /// Returns an input slot.
    #[must_use]
    pub fn input(&self, input: usize) -> Option<&InputSpec> {
        self.inputs.get(input)
    }

    /// Finds the flow a packet with identifier `flow_id` belongs to, and
    /// the direction it travels in.
    #[must_use]
    pub fn lookup(&self, flow_id: &FlowId) -> Option<(FlowHandle, Direction)> {
        self.map.get(flow_id).copied()
    }

    /// Returns a live flow.
    #[must_use]
    pub fn get(&self, handle: FlowHandle) -> Option<&Flow> {
        self.arena.get(handle)
    }

    /// Returns a live flow mutably.
    pub fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut Flow> {
        self.arena.get_mut(handle)
    }

    /// Iterates over live flows.
    pub fn flows(&self) -> impl Iterator<Item = (FlowHandle, &Flow)> {
        self.arena.iter()
    }

    /// Creates a flow that rewrites `flow_id` into `rewritten`.
    ///
    /// The flow starts guaranteed when the configuration has a guarantee
    /// period, best-effort otherwise. A full table first reclaims expired
    /// flows and then the earliest best-effort flow.
    ///
    /// # Errors
    ///
    /// Returns an error if the input slot does not exist, if either
    /// direction of the new flow is already mapped, or if the table is full
    /// of flows that cannot be reclaimed.
    pub fn create(
        &mut self,
        flow_id: FlowId,
        rewritten: FlowId,
        input: usize,
        now: Jiffies,
    ) -> Result<FlowHandle> {
        let Some(spec) = self.inputs.get(input) else {
            return Err(RewriteError::UnknownInput(input));
        };
        let (foutput, routput) = (spec.foutput, spec.routput);

        let reply_id = rewritten.reverse();
        for id in [flow_id, reply_id] {
            if self.map.contains_key(&id) {
                return Err(RewriteError::DuplicateFlow(id));
            }
        }
        if flow_id == reply_id {
            return Err(RewriteError::DuplicateFlow(flow_id));
        }

        if self.len() >= self.config.capacity && !self.shrink_for_new_flow(now) {
            self.stats.refused += 1;
            tracing::warn!(
                flow = %flow_id,
                capacity = self.config.capacity,
                "flow table full, refusing new flow"
            );
            return Err(RewriteError::TableFull {
                capacity: self.config.capacity,
            });
        }

        let guarantee = self.config.guarantee();
        let (guaranteed, expiry) = if guarantee == 0 {
            (
                false,
                now.saturating_add(self.config.best_effort_timeout(flow_id.transport(), false)),
            )
        } else {
            (true, now.saturating_add(guarantee))
        };

        let flow = Flow::new(flow_id, foutput, rewritten, routput, guaranteed, expiry, input);
        let handle = self.arena.insert(flow);
        self.heap.push(&mut self.arena, handle);
        self.map.insert(flow_id, (handle, Direction::Forward));
        self.map.insert(reply_id, (handle, Direction::Reply));
        self.inputs[input].count += 1;
        self.stats.created += 1;

        tracing::debug!(
            flow = %flow_id,
            rewritten = %rewritten,
            input,
            guaranteed,
            expiry,
            "created flow"
        );
        Ok(handle)
    }

    /// Destroys a flow, returning it if the handle was live.
    ///
    /// The flow leaves its heap, its input slot's count drops, and both of
    /// its identifiers are unmapped before this returns.
    pub fn destroy(&mut self, handle: FlowHandle) -> Option<Flow> {
        let input = self.arena.get(handle)?.owner_input();
        self.heap.remove(&mut self.arena, handle);
        self.inputs[input].count -= 1;
        let flow = self.flow_destroyed(handle)?;

        self.stats.destroyed += 1;
        tracing::debug!(flow = %flow.flow_id(), input, "destroyed flow");
        Some(flow)
    }

    /// Destroys the flow a packet with identifier `flow_id` would match.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no flow maps `flow_id`.
    pub fn evict(&mut self, flow_id: &FlowId) -> Result<Flow> {
        self.lookup(flow_id)
            .and_then(|(handle, _)| self.destroy(handle))
            .ok_or_else(|| CommonError::not_found(format!("flow {flow_id}")).into())
    }

    /// Drops a destroyed flow's index entries and storage.
    fn flow_destroyed(&mut self, handle: FlowHandle) -> Option<Flow> {
        let flow = self.arena.remove(handle)?;
        for direction in [Direction::Forward, Direction::Reply] {
            self.map.remove(flow.endpoint(direction).flow_id());
        }
        Some(flow)
    }

    /// Sets a flow's guarantee and expiry.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn change_expiry(&mut self, handle: FlowHandle, guaranteed: bool, expiry: Jiffies) {
        self.heap.change_expiry(&mut self.arena, handle, guaranteed, expiry);
    }

    /// Refreshes a flow's expiry after it carried traffic at `now`.
    ///
    /// Finished TCP sessions become best-effort with the closed timeout.
    /// Other flows are guaranteed for the guarantee period, or best-effort
    /// for their protocol's timeout when guarantees are disabled.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn refresh(&mut self, handle: FlowHandle, now: Jiffies) {
        let flow = &self.arena[handle];
        let session_over = flow.session_over();
        let best_effort = self.config.best_effort_timeout(flow.protocol(), session_over);
        if session_over {
            self.change_expiry(handle, false, now.saturating_add(best_effort));
        } else {
            let guarantee = self.config.guarantee();
            self.heap
                .change_expiry_by_timeout(&mut self.arena, handle, now, best_effort, guarantee);
        }
    }

    /// Rewrites a packet of a known flow and refreshes the flow's expiry.
    ///
    /// Returns the output port for the packet, or `None` if the packet
    /// belongs to no flow in this table. Non-initial fragments carry no
    /// ports, so they never match here; callers that track fragments pass
    /// the datagram's identifier to [`FlowTable::rewrite_with_id`].
    pub fn rewrite(&mut self, packet: &mut Packet, now: Jiffies) -> Option<usize> {
        let flow_id = FlowId::from_packet(packet)?;
        self.rewrite_with_id(packet, &flow_id, now)
    }

    /// Rewrites a packet as part of the flow `flow_id` names.
    ///
    /// For non-initial fragments only the IP header changes.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no network header.
    pub fn rewrite_with_id(
        &mut self,
        packet: &mut Packet,
        flow_id: &FlowId,
        now: Jiffies,
    ) -> Option<usize> {
        let (handle, direction) = self.lookup(flow_id)?;

        let annos = self.config.annotations();
        let flow = &mut self.arena[handle];
        flow.apply(packet, direction, annos);
        let output = flow.output(direction);

        self.refresh(handle, now);
        self.stats.rewritten += 1;
        Some(output)
    }

    /// Reclaims expired flows.
    ///
    /// Guaranteed flows whose guarantee has lapsed move to the best-effort
    /// heap at their effective expiry, or are destroyed if that has passed
    /// too. Expired best-effort flows are destroyed, and best-effort flows
    /// are evicted in expiry order while the table is over capacity.
    /// Returns the number of flows destroyed.
    pub fn gc(&mut self, now: Jiffies) -> usize {
        let mut destroyed = 0;
        let mut demoted = 0;

        while let Some(handle) = self.heap.peek_min(true) {
            let flow = &self.arena[handle];
            if !flow.expired(now) {
                break;
            }
            let expiry = self.effective_expiry(flow);
            if expiry <= now {
                self.destroy(handle);
                self.stats.expired += 1;
                destroyed += 1;
            } else {
                self.change_expiry(handle, false, expiry);
                demoted += 1;
            }
        }

        while let Some(handle) = self.heap.peek_min(false) {
            if !self.arena[handle].expired(now) {
                break;
            }
            self.destroy(handle);
            self.stats.expired += 1;
            destroyed += 1;
        }

        while self.len() > self.config.capacity {
            let Some(handle) = self.heap.peek_min(false) else {
                break;
            };
            self.destroy(handle);
            self.stats.evicted += 1;
            destroyed += 1;
        }

        self.stats.demoted += demoted;
        if destroyed > 0 || demoted > 0 {
            tracing::debug!(now, destroyed, demoted, live = self.len(), "flow gc");
        }
        destroyed
    }

    /// Makes room for one more flow. Returns false if every live flow is
    /// guaranteed and unexpired.
    fn shrink_for_new_flow(&mut self, now: Jiffies) -> bool {
        self.gc(now);
        if self.len() < self.config.capacity {
            return true;
        }
        let Some(handle) = self.heap.peek_min(false) else {
            return false;
        };
        self.destroy(handle);
        self.stats.evicted += 1;
        true
    }

    /// Destroys every flow.
    pub fn clear(&mut self) {
        let handles: Vec<_> = self.arena.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            self.destroy(handle);
        }
        debug_assert!(self.map.is_empty() && self.heap.is_empty());
    }

    /// Returns true if the heaps are ordered, every heap position is
    /// accurate, and each live flow is indexed under both identifiers and
    /// counted by its input slot.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let indexed = self.arena.iter().all(|(handle, flow)| {
            [Direction::Forward, Direction::Reply].into_iter().all(|direction| {
                self.lookup(flow.endpoint(direction).flow_id()) == Some((handle, direction))
            })
        });
        let counted = self
            .inputs
            .iter()
            .enumerate()
            .all(|(input, spec)| {
                spec.count == self.arena.iter().filter(|(_, f)| f.owner_input() == input).count()
            });
        indexed
            && counted
            && self.map.len() == 2 * self.arena.len()
            && self.heap.len() == self.arena.len()
            && self.heap.is_consistent(&self.arena)
    }

    /// Renders one line per live flow, forward direction first.
    #[must_use]
    pub fn dump(&self, now: Jiffies) -> String {
        let mut out = String::new();
        for (_, flow) in self.arena.iter() {
            out.push_str(&flow.unparse(self, Direction::Forward, now));
            out.push('\n');
        }
        out
    }
}

impl FlowOwner for FlowTable {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn reply_element(&self, input: usize) -> &str {
        self.inputs
            .get(input)
            .map_or(self.config.name.as_str(), |spec| spec.reply_element.as_str())
    }

    /// Guaranteed flows fall back to best-effort once the guarantee lapses,
    /// so their effective expiry is the last refresh plus the best-effort
    /// timeout. Best-effort flows expire when they say.
    fn effective_expiry(&self, flow: &Flow) -> Jiffies {
        if flow.guaranteed() {
            let timeout = self
                .config
                .best_effort_timeout(flow.protocol(), flow.session_over());
            flow.expiry()
                .saturating_add(timeout)
                .saturating_sub(self.config.guarantee())
        } else {
            flow.expiry()
        }
    }
}

impl fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("name", &self.config.name)
            .field("flows", &self.arena.len())
            .field("capacity", &self.config.capacity)
            .field("inputs", &self.inputs.len())
            .finish_non_exhaustive()
    }
}
