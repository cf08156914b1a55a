//! Entity records of a channel, stored in an arena and linked into chains.
//!
//! Every entity is a member of two doubly linked chains: its data file's
//! chain (ordered by position in the file) and its type's chain. The links
//! are generation-checked [`EntityKey`]s into an [`EntityArena`], so a key
//! of a removed entity can never reach its slot's next occupant.

use bytes::Bytes;
use crate::types::{ObjectId, TypeId};

/// Handle of an entity in an [`EntityArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntityKey {
    index: u32,
    generation: u32,
}

/// Mark state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcColor {
    /// Registered at startup; survives the current sweep round.
    Initial,
    /// Not (yet) reached by marking.
    White,
    /// Reached, references not yet followed.
    Gray,
    /// Reached, references followed.
    Black,
}

impl GcColor {
    /// Returns true if a sweep must keep the entity.
    #[must_use]
    pub const fn is_marked(self) -> bool {
        !matches!(self, Self::White)
    }
}

/// Which of an entity's two chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainKind {
    File = 0,
    Type = 1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Links {
    prev: Option<EntityKey>,
    next: Option<EntityKey>,
}

/// Ends and length of a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Chain {
    head: Option<EntityKey>,
    tail: Option<EntityKey>,
    len: usize,
}

impl Chain {
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) const fn first(&self) -> Option<EntityKey> {
        self.head
    }
}

/// A registered entity.
#[derive(Debug, Clone)]
pub(crate) struct Entity {
    pub(crate) object_id: ObjectId,
    pub(crate) type_id: TypeId,
    pub(crate) file_number: u64,
    pub(crate) position: u64,
    pub(crate) length: u64,
    pub(crate) last_touched: i64,
    pub(crate) cached: Option<Bytes>,
    pub(crate) color: GcColor,
    pub(crate) has_references: bool,
    links: [Links; 2],
}

impl Entity {
    pub(crate) fn new(
        object_id: ObjectId,
        type_id: TypeId,
        file_number: u64,
        position: u64,
        length: u64,
        has_references: bool,
    ) -> Self {
        Self {
            object_id,
            type_id,
            file_number,
            position,
            length,
            last_touched: i64::MAX,
            cached: None,
            color: GcColor::Initial,
            has_references,
            links: [Links::default(); 2],
        }
    }

    pub(crate) fn cached_length(&self) -> i64 {
        self.cached.as_ref().map_or(0, |data| data.len() as i64)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Slot storage for a channel's entities.
#[derive(Debug, Default)]
pub(crate) struct EntityArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl EntityArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Number of slots, occupied or not; bounds [`EntityArena::get_at_mut`].
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn insert(&mut self, entity: Entity) -> EntityKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            return EntityKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entity: Some(entity),
        });
        EntityKey { index, generation: 0 }
    }

    /// Removes an entity. It must already be unlinked from its chains.
    pub(crate) fn remove(&mut self, key: EntityKey) -> Option<Entity> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let entity = slot.entity.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(entity)
    }

    pub(crate) fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_mut())
    }

    /// The entity in slot `index`, if occupied.
    pub(crate) fn get_at_mut(&mut self, index: usize) -> Option<&mut Entity> {
        self.slots.get_mut(index).and_then(|slot| slot.entity.as_mut())
    }

    fn links_mut(&mut self, key: EntityKey, kind: ChainKind) -> Option<&mut Links> {
        self.get_mut(key).map(|entity| &mut entity.links[kind as usize])
    }

    /// Appends `key` at the end of `chain`.
    pub(crate) fn push_back(&mut self, chain: &mut Chain, kind: ChainKind, key: EntityKey) {
        let old_tail = chain.tail;
        if let Some(links) = self.links_mut(key, kind) {
            *links = Links {
                prev: old_tail,
                next: None,
            };
        } else {
            return;
        }
        match old_tail.and_then(|tail| self.links_mut(tail, kind)) {
            Some(tail_links) => tail_links.next = Some(key),
            None => chain.head = Some(key),
        }
        chain.tail = Some(key);
        chain.len += 1;
    }

    /// Removes `key` from `chain`.
    pub(crate) fn unlink(&mut self, chain: &mut Chain, kind: ChainKind, key: EntityKey) {
        let Some(links) = self.links_mut(key, kind).map(|links| std::mem::take(links)) else {
            return;
        };
        match links.prev.and_then(|prev| self.links_mut(prev, kind)) {
            Some(prev_links) => prev_links.next = links.next,
            None => chain.head = links.next,
        }
        match links.next.and_then(|next| self.links_mut(next, kind)) {
            Some(next_links) => next_links.prev = links.prev,
            None => chain.tail = links.prev,
        }
        chain.len -= 1;
    }

    /// The successor of `key` in its chain of `kind`.
    pub(crate) fn next(&self, key: EntityKey, kind: ChainKind) -> Option<EntityKey> {
        self.get(key).and_then(|entity| entity.links[kind as usize].next)
    }

    /// Iterates over the keys of `chain` in order.
    pub(crate) fn iter_chain<'a>(&'a self, chain: &Chain, kind: ChainKind) -> ChainIter<'a> {
        ChainIter {
            arena: self,
            next: chain.head,
            kind,
        }
    }
}

/// Iterator over a chain's keys.
pub(crate) struct ChainIter<'a> {
    arena: &'a EntityArena,
    next: Option<EntityKey>,
    kind: ChainKind,
}

impl Iterator for ChainIter<'_> {
    type Item = EntityKey;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        self.next = self.arena.next(key, self.kind);
        Some(key)
    }
}
