//! Expiry ordering.
//!
//! [`ExpiryHeap`] keeps two binary min-heaps of flow handles keyed by
//! [`Flow::expiry`], one for best-effort flows and one for guaranteed
//! flows. Every flow records its slot in [`Flow::heap_position`], so moving
//! or removing an arbitrary flow costs O(log n).
//!
//! ```text
//!   best-effort   [h3, h7, h1, ...]   evictable early, in expiry order
//!   guaranteed    [h2, h5, ...]       reclaimed only once expired
//! ```

use super::arena::{FlowArena, FlowHandle};
use super::{Jiffies, flow::Flow};

/// Two position-tracking min-heaps of flows, split by guarantee.
#[derive(Debug, Default)]
pub struct ExpiryHeap {
    /// Index 0 holds best-effort flows, index 1 guaranteed flows.
    heaps: [Vec<FlowHandle>; 2],
}

#[inline]
fn category(guaranteed: bool) -> usize {
    usize::from(guaranteed)
}

impl ExpiryHeap {
    /// Creates empty heaps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of flows in both heaps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heaps[0].len() + self.heaps[1].len()
    }

    /// Returns true if both heaps are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of flows in one category.
    #[must_use]
    pub fn category_len(&self, guaranteed: bool) -> usize {
        self.heaps[category(guaranteed)].len()
    }

    /// Returns one category's heap array.
    #[must_use]
    pub fn entries(&self, guaranteed: bool) -> &[FlowHandle] {
        &self.heaps[category(guaranteed)]
    }

    /// Returns the earliest-expiring flow of a category without removing it.
    #[must_use]
    pub fn peek_min(&self, guaranteed: bool) -> Option<FlowHandle> {
        self.heaps[category(guaranteed)].first().copied()
    }

    /// Forgets every entry. The flows themselves are untouched.
    pub fn clear(&mut self) {
        self.heaps[0].clear();
        self.heaps[1].clear();
    }

    /// Adds a flow to the heap matching its guarantee.
    pub fn push(&mut self, arena: &mut FlowArena, handle: FlowHandle) {
        let heap = &mut self.heaps[category(arena[handle].guaranteed())];
        heap.push(handle);
        let pos = heap.len() - 1;
        arena[handle].heap_position = pos;
        sift_up(heap, arena, pos);
    }

    /// Removes a flow from its heap.
    ///
    /// The flow's `heap_position` is stale afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the flow's recorded position does not hold it.
    pub fn remove(&mut self, arena: &mut FlowArena, handle: FlowHandle) {
        let flow = &arena[handle];
        let heap = &mut self.heaps[category(flow.guaranteed())];
        let pos = checked_position(heap, flow, handle);

        heap.swap_remove(pos);
        if pos < heap.len() {
            arena[heap[pos]].heap_position = pos;
            repair(heap, arena, pos);
        }
    }

    /// Sets a flow's guarantee and expiry, moving it between heaps when the
    /// guarantee changes.
    ///
    /// # Panics
    ///
    /// Panics if the flow's recorded position does not hold it.
    pub fn change_expiry(
        &mut self,
        arena: &mut FlowArena,
        handle: FlowHandle,
        guaranteed: bool,
        expiry: Jiffies,
    ) {
        let flow = &arena[handle];
        let was_guaranteed = flow.guaranteed();
        let pos = checked_position(&self.heaps[category(was_guaranteed)], flow, handle);

        if was_guaranteed == guaranteed {
            arena[handle].set_expiry(expiry);
            repair(&mut self.heaps[category(guaranteed)], arena, pos);
            return;
        }

        tracing::trace!(
            flow = %arena[handle].flow_id(),
            guaranteed,
            expiry,
            "moving flow between expiry heaps"
        );
        self.remove(arena, handle);
        let flow = &mut arena[handle];
        flow.set_expiry(expiry);
        flow.set_guaranteed(guaranteed);
        self.push(arena, handle);
    }

    /// Refreshes a flow's expiry from timeouts in jiffies.
    ///
    /// A non-zero `guarantee` keeps the flow guaranteed for that long;
    /// otherwise it becomes best-effort for `best_effort`.
    pub fn change_expiry_by_timeout(
        &mut self,
        arena: &mut FlowArena,
        handle: FlowHandle,
        now: Jiffies,
        best_effort: Jiffies,
        guarantee: Jiffies,
    ) {
        if guarantee == 0 {
            self.change_expiry(arena, handle, false, now.saturating_add(best_effort));
        } else {
            self.change_expiry(arena, handle, true, now.saturating_add(guarantee));
        }
    }

    /// Returns true if both heaps are ordered and every flow's recorded
    /// position matches its slot.
    #[must_use]
    pub fn is_consistent(&self, arena: &FlowArena) -> bool {
        self.heaps.iter().enumerate().all(|(cat, heap)| {
            heap.iter().enumerate().all(|(pos, &handle)| {
                let Some(flow) = arena.get(handle) else {
                    return false;
                };
                let parent_ok = pos == 0 || arena[heap[(pos - 1) / 2]].expiry() <= flow.expiry();
                flow.heap_position() == pos && category(flow.guaranteed()) == cat && parent_ok
            })
        })
    }
}

fn checked_position(heap: &[FlowHandle], flow: &Flow, handle: FlowHandle) -> usize {
    let pos = flow.heap_position();
    assert!(
        heap.get(pos) == Some(&handle),
        "heap position {pos} does not hold flow {}",
        flow.flow_id()
    );
    pos
}

#[inline]
fn key(arena: &FlowArena, heap: &[FlowHandle], pos: usize) -> Jiffies {
    arena[heap[pos]].expiry()
}

#[inline]
fn swap(heap: &mut [FlowHandle], arena: &mut FlowArena, a: usize, b: usize) {
    heap.swap(a, b);
    arena[heap[a]].heap_position = a;
    arena[heap[b]].heap_position = b;
}

/// Restores order around `pos` after its key changed in either direction.
fn repair(heap: &mut [FlowHandle], arena: &mut FlowArena, pos: usize) {
    if pos > 0 && key(arena, heap, pos) < key(arena, heap, (pos - 1) / 2) {
        sift_up(heap, arena, pos);
    } else {
        sift_down(heap, arena, pos);
    }
}

fn sift_up(heap: &mut [FlowHandle], arena: &mut FlowArena, mut pos: usize) {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if key(arena, heap, parent) <= key(arena, heap, pos) {
            break;
        }
        swap(heap, arena, parent, pos);
        pos = parent;
    }
}

fn sift_down(heap: &mut [FlowHandle], arena: &mut FlowArena, mut pos: usize) {
    loop {
        let left = 2 * pos + 1;
        if left >= heap.len() {
            break;
        }
        let right = left + 1;
        let child = if right < heap.len() && key(arena, heap, right) < key(arena, heap, left) {
            right
        } else {
            left
        };
        if key(arena, heap, pos) <= key(arena, heap, child) {
            break;
        }
        swap(heap, arena, pos, child);
        pos = child;
    }
}
