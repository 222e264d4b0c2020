//! Flow storage.
//!
//! Flows are referenced from two places at once (the lookup map holds one
//! entry per direction, and the expiry heap holds one entry per flow), so
//! they live in an arena and are named by [`FlowHandle`]s. Freed slots are
//! reused through a free list; each slot carries a generation so a handle
//! to a destroyed flow never aliases the slot's next occupant.

use std::ops::{Index, IndexMut};

use super::flow::Flow;

/// Handle to a flow stored in a [`FlowArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    index: u32,
    generation: u32,
}

impl FlowHandle {
    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    flow: Option<Flow>,
}

/// Generational slot storage for flows.
#[derive(Debug, Default)]
pub struct FlowArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl FlowArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty arena with room for `capacity` flows.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of live flows.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no flows are stored.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a flow and returns its handle.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` slots would be needed.
    pub fn insert(&mut self, flow: Flow) -> FlowHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.flow.is_none());
            slot.flow = Some(flow);
            return FlowHandle {
                index,
                generation: slot.generation,
            };
        }

        assert!(self.slots.len() < u32::MAX as usize, "flow arena exhausted");
        #[allow(clippy::cast_possible_truncation)]
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            flow: Some(flow),
        });
        FlowHandle {
            index,
            generation: 0,
        }
    }

    /// Removes a flow, returning it if the handle was live.
    pub fn remove(&mut self, handle: FlowHandle) -> Option<Flow> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let flow = slot.flow.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(flow)
    }

    /// Returns true if the handle refers to a live flow.
    #[must_use]
    pub fn contains(&self, handle: FlowHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Returns the flow for a live handle.
    #[must_use]
    pub fn get(&self, handle: FlowHandle) -> Option<&Flow> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.flow.as_ref())
    }

    /// Returns the flow for a live handle mutably.
    pub fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut Flow> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.flow.as_mut())
    }

    /// Iterates over live flows in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (FlowHandle, &Flow)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let flow = slot.flow.as_ref()?;
            // Slot count never exceeds u32::MAX, see insert.
            #[allow(clippy::cast_possible_truncation)]
            let index = index as u32;
            Some((
                FlowHandle {
                    index,
                    generation: slot.generation,
                },
                flow,
            ))
        })
    }

    /// Removes every flow. Outstanding handles become stale.
    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.flow.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            #[allow(clippy::cast_possible_truncation)]
            self.free.push(index as u32);
        }
        self.len = 0;
    }
}

impl Index<FlowHandle> for FlowArena {
    type Output = Flow;

    fn index(&self, handle: FlowHandle) -> &Flow {
        match self.get(handle) {
            Some(flow) => flow,
            None => panic!("stale flow handle {handle:?}"),
        }
    }
}

impl IndexMut<FlowHandle> for FlowArena {
    fn index_mut(&mut self, handle: FlowHandle) -> &mut Flow {
        match self.get_mut(handle) {
            Some(flow) => flow,
            None => panic!("stale flow handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::rewriter::FlowId;

    fn flow(port: u16) -> Flow {
        let id = FlowId::new(Ipv4Addr::new(10, 0, 0, 1), port, Ipv4Addr::new(10, 0, 0, 2), 80, 6);
        Flow::new(id, 0, id, 1, false, 0, 0)
    }

    #[test]
    fn test_insert_get_remove() {
        let mut arena = FlowArena::new();
        assert!(arena.is_empty());

        let a = arena.insert(flow(1));
        let b = arena.insert(flow(2));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[a].flow_id().sport, 1);
        assert_eq!(arena[b].flow_id().sport, 2);

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.flow_id().sport, 1);
        assert_eq!(arena.len(), 1);
        assert!(!arena.contains(a));
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn test_reused_slot_invalidates_old_handle() {
        let mut arena = FlowArena::new();
        let a = arena.insert(flow(1));
        arena.remove(a);
        let c = arena.insert(flow(3));

        assert_eq!(a.index(), c.index());
        assert_ne!(a, c);
        assert!(arena.get(a).is_none());
        assert_eq!(arena[c].flow_id().sport, 3);
    }

    #[test]
    fn test_iter_and_clear() {
        let mut arena = FlowArena::with_capacity(4);
        let handles: Vec<_> = (1..=3).map(|p| arena.insert(flow(p))).collect();
        arena.remove(handles[1]);

        let ports: Vec<_> = arena.iter().map(|(_, f)| f.flow_id().sport).collect();
        assert_eq!(ports, vec![1, 3]);
        assert_eq!(arena.iter().next().unwrap().0, handles[0]);

        arena.clear();
        assert!(arena.is_empty());
        assert!(handles.iter().all(|&h| !arena.contains(h)));
        let d = arena.insert(flow(4));
        assert_eq!(d.index(), 0);
    }

    #[test]
    #[should_panic(expected = "stale flow handle")]
    fn test_index_stale_panics() {
        let mut arena = FlowArena::new();
        let a = arena.insert(flow(1));
        arena.remove(a);
        let _ = &arena[a];
    }
}
