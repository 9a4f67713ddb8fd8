//! Slot table and deadline heap.
//!
//! Requests live in a growable slot table with a free list. Armed slots are additionally
//! referenced from a binary min-heap ordered by deadline; each armed slot caches its heap
//! position so that cancellation removes it in O(log n) without searching.
//!
//! A slot's generation is bumped both when it is handed out and when it is released, so every
//! token that was ever issued for a slot stops matching as soon as that request is over.

use aero_dispatch::{Callback, DispatchToken};

use crate::clock::Tick;
use crate::token::{decode, encode, TokenCell};

/// Slot indices must leave room for the off-by-one encoding in the token.
const MAX_SLOTS: usize = u32::MAX as usize;

enum SlotState {
    Free,
    Armed {
        heap_pos: usize,
    },
    /// Due and handed to the dispatcher, but the callback has not run yet. The dispatcher token
    /// is filled in once the hand-off has been recorded.
    Dispatched(Option<DispatchToken>),
}

struct Slot {
    deadline: Tick,
    generation: u32,
    state: SlotState,
    callback: Option<Callback>,
    token: Option<TokenCell>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            deadline: 0,
            generation: 0,
            state: SlotState::Free,
            callback: None,
            token: None,
        }
    }

    /// Returns the slot to the free state and invalidates outstanding tokens.
    fn release(&mut self, index: u32) -> Released {
        let raw = encode(index, self.generation);
        if let Some(cell) = self.token.take() {
            cell.clear_if(raw);
        }
        self.generation = self.generation.wrapping_add(1);
        let dispatch = match std::mem::replace(&mut self.state, SlotState::Free) {
            SlotState::Dispatched(dispatch) => dispatch,
            SlotState::Free | SlotState::Armed { .. } => None,
        };
        Released {
            callback: self.callback.take(),
            dispatch,
            was_root: false,
        }
    }
}

/// Resources detached from a released slot. They must be disposed of after the scheduler lock
/// is dropped: cancelling the dispatcher entry and dropping the callback can both run arbitrary
/// code.
#[must_use]
pub(crate) struct Released {
    pub callback: Option<Callback>,
    pub dispatch: Option<DispatchToken>,
    /// The request was at the root of the heap, i.e. the one the timer is armed for.
    pub was_root: bool,
}

/// A request that became due and was removed from the heap.
pub(crate) struct Due {
    pub index: u32,
    pub generation: u32,
    pub callback: Option<Callback>,
}

#[derive(Default)]
pub(crate) struct TimerTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    heap: Vec<u32>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests that have neither run nor been cancelled.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn next_deadline(&self) -> Option<Tick> {
        self.heap.first().map(|&index| self.deadline_of(index))
    }

    /// Arms a new request and returns its token and whether it became the earliest deadline.
    pub fn insert(&mut self, deadline: Tick, callback: Callback, token: TokenCell) -> (u64, bool) {
        let index = self.allocate();
        let pos = self.heap.len();

        let slot = &mut self.slots[index as usize];
        debug_assert!(matches!(slot.state, SlotState::Free));
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = deadline;
        slot.callback = Some(callback);
        slot.token = Some(token);
        slot.state = SlotState::Armed { heap_pos: pos };
        let raw = encode(index, slot.generation);

        self.heap.push(index);
        let pos = self.sift_up(pos);
        (raw, pos == 0)
    }

    /// Releases the request named by `raw`. Unknown, stale and already released tokens yield
    /// `None`.
    pub fn cancel(&mut self, raw: u64) -> Option<Released> {
        let (index, generation) = decode(raw)?;
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }

        let was_root = match slot.state {
            SlotState::Free => return None,
            SlotState::Armed { heap_pos } => {
                self.remove_at(heap_pos);
                heap_pos == 0
            }
            SlotState::Dispatched(_) => false,
        };

        let mut released = self.slots[index as usize].release(index);
        released.was_root = was_root;
        self.free.push(index);
        Some(released)
    }

    /// Removes the earliest request if its deadline is at or before `now`.
    ///
    /// The slot stays allocated (in the dispatched state) until [`retire`](Self::retire) or
    /// [`cancel`](Self::cancel) is called for it.
    pub fn pop_due(&mut self, now: Tick) -> Option<Due> {
        let &index = self.heap.first()?;
        if self.deadline_of(index) > now {
            return None;
        }

        self.remove_at(0);
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Dispatched(None);
        Some(Due {
            index,
            generation: slot.generation,
            callback: slot.callback.take(),
        })
    }

    /// Records the dispatcher entry for a due request. Hands the token back if the request was
    /// cancelled (or already retired) in the meantime.
    pub fn attach_dispatch(
        &mut self,
        index: u32,
        generation: u32,
        dispatch: DispatchToken,
    ) -> Result<(), DispatchToken> {
        match self.slots.get_mut(index as usize) {
            Some(slot)
                if slot.generation == generation
                    && matches!(slot.state, SlotState::Dispatched(None)) =>
            {
                slot.state = SlotState::Dispatched(Some(dispatch));
                Ok(())
            }
            _ => Err(dispatch),
        }
    }

    /// Frees the slot of a dispatched request whose callback is about to run. Returns `false` if
    /// the request was cancelled after it was handed off.
    pub fn retire(&mut self, index: u32, generation: u32) -> bool {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return false;
        };
        if slot.generation != generation || !matches!(slot.state, SlotState::Dispatched(_)) {
            return false;
        }

        // Nothing to dispose of: the callback travelled with the dispatcher entry, which is the
        // one currently running.
        let _ = slot.release(index);
        self.free.push(index);
        true
    }

    /// Releases every outstanding request.
    pub fn drain(&mut self) -> Vec<Released> {
        self.heap.clear();
        let mut released = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Free) {
                continue;
            }
            released.push(slot.release(index as u32));
            self.free.push(index as u32);
        }
        released
    }

    fn allocate(&mut self) -> u32 {
        if let Some(index) = self.free.pop() {
            return index;
        }
        // Running out of slot indices is resource exhaustion, not a recoverable condition.
        assert!(
            self.slots.len() < MAX_SLOTS,
            "timer service: slot table exhausted"
        );
        self.slots.push(Slot::vacant());
        (self.slots.len() - 1) as u32
    }

    #[inline]
    fn deadline_of(&self, index: u32) -> Tick {
        self.slots[index as usize].deadline
    }

    #[inline]
    fn key(&self, pos: usize) -> Tick {
        self.deadline_of(self.heap[pos])
    }

    fn set_pos(&mut self, pos: usize) {
        let index = self.heap[pos];
        self.slots[index as usize].state = SlotState::Armed { heap_pos: pos };
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_pos(a);
        self.set_pos(b);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.key(parent) <= self.key(pos) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.heap.len();
        loop {
            let left = pos * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.key(right) < self.key(left) {
                right
            } else {
                left
            };
            if self.key(pos) <= self.key(child) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos
    }

    /// Removes the heap entry at `pos`. The removed slot's state is left for the caller to set.
    fn remove_at(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        self.heap.pop();
        if pos < self.heap.len() && self.sift_down(pos) == pos {
            self.sift_up(pos);
        }
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (pos, &index) in self.heap.iter().enumerate() {
            match self.slots[index as usize].state {
                SlotState::Armed { heap_pos } => assert_eq!(heap_pos, pos, "stale heap position"),
                _ => panic!("heap references slot {index} which is not armed"),
            }
            if pos > 0 {
                assert!(self.key((pos - 1) / 2) <= self.key(pos), "min-heap violated at {pos}");
            }
        }

        let armed = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Armed { .. }))
            .count();
        assert_eq!(armed, self.heap.len());

        let mut free = self.free.clone();
        free.sort_unstable();
        free.dedup();
        assert_eq!(free.len(), self.free.len(), "duplicate free-list entry");
        for &index in &self.free {
            assert!(matches!(self.slots[index as usize].state, SlotState::Free));
        }
        let vacant = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Free))
            .count();
        assert_eq!(vacant, self.free.len());
    }
}
