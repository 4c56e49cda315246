//! Preallocated probe events and the time-sorted queues that drive the
//! main loop.
//!
//! Every host owns a fixed range of slots inside an arena (one arena for
//! ping events, one for timeout events), addressed by `ping_index mod
//! slots_per_host`. The queues are intrusive doubly-linked lists over
//! arena indices, so scheduling a probe never allocates.
//!
//! Two queues are kept because the ping period and the timeout value are
//! different cadences; mixing them in one sorted list would lengthen the
//! insertion scan.

pub type SlotId = u32;

const NIL: SlotId = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct EventSlot {
    pub time_ns: i64,
    pub host: u32,
    pub ping_index: u32,
    prev: SlotId,
    next: SlotId,
    queued: bool,
}

impl EventSlot {
    fn empty() -> Self {
        Self {
            time_ns: 0,
            host: 0,
            ping_index: 0,
            prev: NIL,
            next: NIL,
            queued: false,
        }
    }
}

/// Fixed pool of event slots, `slots_per_host` per target.
pub struct EventArena {
    slots: Vec<EventSlot>,
    slots_per_host: usize,
}

impl EventArena {
    pub fn new(num_hosts: usize, slots_per_host: usize) -> Self {
        assert!(slots_per_host > 0);
        Self {
            slots: vec![EventSlot::empty(); num_hosts * slots_per_host],
            slots_per_host,
        }
    }

    /// Slot that holds events for this (host, ping_index) pair. Slots are
    /// reused by `ping_index mod slots_per_host`; the caller guarantees at
    /// most one live event per slot.
    pub fn slot_id(&self, host: u32, ping_index: usize) -> SlotId {
        (host as usize * self.slots_per_host + ping_index % self.slots_per_host) as SlotId
    }

    pub fn slot(&self, id: SlotId) -> &EventSlot {
        &self.slots[id as usize]
    }

    pub fn is_queued(&self, id: SlotId) -> bool {
        self.slots[id as usize].queued
    }
}

/// Doubly-linked list of arena slots sorted ascending by `time_ns`.
pub struct EventQueue {
    head: SlotId,
    tail: SlotId,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Earliest deadline in the queue.
    pub fn head_time(&self, arena: &EventArena) -> Option<i64> {
        if self.head == NIL {
            None
        } else {
            Some(arena.slots[self.head as usize].time_ns)
        }
    }

    /// Write the (host, ping_index, time) triple into the owning slot and
    /// link it into the queue.
    pub fn schedule(
        &mut self,
        arena: &mut EventArena,
        host: u32,
        ping_index: usize,
        time_ns: i64,
    ) -> SlotId {
        let id = arena.slot_id(host, ping_index);
        debug_assert!(!arena.slots[id as usize].queued, "slot reused while queued");
        {
            let slot = &mut arena.slots[id as usize];
            slot.host = host;
            slot.ping_index = ping_index as u32;
            slot.time_ns = time_ns;
        }
        self.enqueue(arena, id);
        id
    }

    /// Sorted insert, scanning from the tail: new events are almost always
    /// later than everything queued. Equal times insert after existing
    /// entries, which keeps same-time events FIFO (round-robin across
    /// hosts).
    fn enqueue(&mut self, arena: &mut EventArena, id: SlotId) {
        let time_ns = arena.slots[id as usize].time_ns;

        if self.tail == NIL {
            let slot = &mut arena.slots[id as usize];
            slot.prev = NIL;
            slot.next = NIL;
            slot.queued = true;
            self.head = id;
            self.tail = id;
            return;
        }

        if time_ns >= arena.slots[self.tail as usize].time_ns {
            let tail = self.tail;
            arena.slots[tail as usize].next = id;
            let slot = &mut arena.slots[id as usize];
            slot.prev = tail;
            slot.next = NIL;
            slot.queued = true;
            self.tail = id;
            return;
        }

        // Walk back until the predecessor is not later than us
        let mut at = self.tail;
        loop {
            let prev = arena.slots[at as usize].prev;
            if prev == NIL || time_ns >= arena.slots[prev as usize].time_ns {
                {
                    let slot = &mut arena.slots[id as usize];
                    slot.prev = prev;
                    slot.next = at;
                    slot.queued = true;
                }
                arena.slots[at as usize].prev = id;
                if prev != NIL {
                    arena.slots[prev as usize].next = id;
                } else {
                    self.head = id;
                }
                return;
            }
            at = prev;
        }
    }

    pub fn dequeue(&mut self, arena: &mut EventArena) -> Option<SlotId> {
        if self.head == NIL {
            return None;
        }
        let id = self.head;
        self.remove(arena, id);
        Some(id)
    }

    /// Unlink `id`; it must be a member of this queue.
    pub fn remove(&mut self, arena: &mut EventArena, id: SlotId) {
        let (prev, next) = {
            let slot = &arena.slots[id as usize];
            debug_assert!(slot.queued);
            (slot.prev, slot.next)
        };
        if self.head == id {
            self.head = next;
        }
        if self.tail == id {
            self.tail = prev;
        }
        if prev != NIL {
            arena.slots[prev as usize].next = next;
        }
        if next != NIL {
            arena.slots[next as usize].prev = prev;
        }
        let slot = &mut arena.slots[id as usize];
        slot.prev = NIL;
        slot.next = NIL;
        slot.queued = false;
    }
}
