//! Reference-counted storage for the raw byte blocks delivered by the
//! transport.
//!
//! Every window that starts or ends on a report inside a block holds one
//! reference to that block, so memory stays proportional to the number of
//! distinct blocks still referenced rather than to the number of windows.
//! Blocks are addressed by [`ChunkId`] handles; a handle whose slot has been
//! freed (and possibly reused) resolves to `None` instead of aliasing the new
//! occupant.

use std::collections::BTreeMap;

/// Handle to a retained chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct ChunkSlot {
    generation: u32,
    refcount: u32,
    seq: u64,
    data: Option<Box<[u8]>>,
}

#[derive(Default)]
pub struct ChunkArena {
    slots: Vec<ChunkSlot>,
    free: Vec<u32>,
    // Live chunks in arrival order, keyed by sequence number.
    order: BTreeMap<u64, u32>,
    next_seq: u64,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `bytes` into a new chunk with a refcount of one.
    pub fn retain(&mut self, bytes: &[u8]) -> ChunkId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ChunkSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.refcount = 1;
        slot.seq = seq;
        slot.data = Some(bytes.into());
        self.order.insert(seq, index);

        ChunkId {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, id: ChunkId) -> Option<&ChunkSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.data.is_some())
    }

    fn slot_mut(&mut self, id: ChunkId) -> Option<&mut ChunkSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.data.is_some())
    }

    /// Take another reference on a live chunk.
    pub fn clone_ref(&mut self, id: ChunkId) -> ChunkId {
        match self.slot_mut(id) {
            Some(slot) => slot.refcount += 1,
            None => debug_assert!(false, "clone_ref on a released chunk"),
        }
        id
    }

    /// Drop one reference, freeing the chunk when it was the last one.
    pub fn release(&mut self, id: ChunkId) {
        let Some(slot) = self.slot_mut(id) else {
            debug_assert!(false, "release of a released chunk");
            return;
        };

        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }

        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        let seq = slot.seq;
        self.order.remove(&seq);
        self.free.push(id.index);
    }

    pub fn data(&self, id: ChunkId) -> Option<&[u8]> {
        self.slot(id).and_then(|slot| slot.data.as_deref())
    }

    pub fn refcount(&self, id: ChunkId) -> Option<u32> {
        self.slot(id).map(|slot| slot.refcount)
    }

    pub fn is_live(&self, id: ChunkId) -> bool {
        self.slot(id).is_some()
    }

    /// Number of chunks currently holding data.
    pub fn live_chunks(&self) -> usize {
        self.order.len()
    }

    /// Live chunks that arrived after `id`, oldest first.
    pub fn chunks_after(&self, id: ChunkId) -> Vec<ChunkId> {
        let Some(slot) = self.slot(id) else {
            return Vec::new();
        };
        self.order
            .range(slot.seq + 1..)
            .map(|(_, &index)| ChunkId {
                index,
                generation: self.slots[index as usize].generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_and_release() {
        let mut arena = ChunkArena::new();
        let id = arena.retain(&[1, 2, 3]);
        assert_eq!(arena.data(id), Some(&[1u8, 2, 3][..]));
        assert_eq!(arena.refcount(id), Some(1));

        let other = arena.clone_ref(id);
        assert_eq!(other, id);
        assert_eq!(arena.refcount(id), Some(2));

        arena.release(id);
        assert_eq!(arena.live_chunks(), 1);
        arena.release(other);
        assert_eq!(arena.live_chunks(), 0);
        assert!(arena.data(id).is_none());
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut arena = ChunkArena::new();
        let old = arena.retain(&[1]);
        arena.release(old);

        let new = arena.retain(&[2]);
        assert_ne!(old, new);
        assert!(arena.data(old).is_none());
        assert_eq!(arena.data(new), Some(&[2u8][..]));
    }

    #[test]
    fn test_chunks_after_follows_arrival_order() {
        let mut arena = ChunkArena::new();
        let a = arena.retain(&[0]);
        let b = arena.retain(&[1]);
        let c = arena.retain(&[2]);
        arena.release(b);
        // Reuses b's slot but arrives last.
        let d = arena.retain(&[3]);

        assert_eq!(arena.chunks_after(a), vec![c, d]);
        assert_eq!(arena.chunks_after(c), vec![d]);
        assert!(arena.chunks_after(b).is_empty());
    }
}
