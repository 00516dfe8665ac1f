//! Entity handles and the entity directory.
//!
//! An [`Entity`] is an `{index, version}` pair. Indices are recycled after
//! destruction; the version is bumped on every recycle, so a handle held
//! across a destroy is detected as stale in O(1).
//!
//! The [`EntityDirectory`] is the only authority on where an entity's data
//! lives: one slot per index with the liveness flag, the current version, and
//! an [`EntityLocation`] that is `Some` exactly while the entity is alive.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::{ArchetypeId, ChunkId};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A versioned entity handle.
///
/// Versions start at 1, so a zeroed handle never refers to a live entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    version: u32,
}

impl Entity {
    /// Construct an `Entity` from an index and version.
    #[inline]
    pub fn new(index: u32, version: u32) -> Self {
        Self { index, version }
    }

    /// The slot index, reused after destruction.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// The slot version at the time this handle was issued.
    #[inline]
    pub fn version(self) -> u32 {
        self.version
    }

    /// Packed `[version: u32 | index: u32]` representation.
    #[inline]
    pub fn to_bits(self) -> u64 {
        (u64::from(self.version) << 32) | u64::from(self.index)
    }

    /// Reconstruct from [`to_bits`](Self::to_bits).
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            version: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.version)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.version)
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where a live entity's row is stored.
///
/// Row indices shift whenever another row in the same chunk is swap-removed;
/// only the copy held by the directory is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub chunk: ChunkId,
    pub row: u32,
}

// ---------------------------------------------------------------------------
// EntityDirectory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    version: u32,
    alive: bool,
    location: Option<EntityLocation>,
}

/// Per-index liveness, version, and location.
///
/// Free indices are recycled FIFO so versions spread across slots instead of
/// churning one hot index. An index whose version would overflow is retired
/// rather than wrapped, which keeps "strictly greater version on reuse" true
/// forever.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    alive_count: usize,
    retired: usize,
}

impl EntityDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle. The caller must follow up with
    /// [`set_location`](Self::set_location) once the row exists.
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            Entity::new(index, slot.version)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                version: 1,
                alive: true,
                location: None,
            });
            Entity::new(index, 1)
        }
    }

    /// Mark `entity` dead, clear its location, and bump the slot version.
    ///
    /// Returns the location it had, or `None` if the handle was stale.
    pub fn free(&mut self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.live_slot_mut(entity)?;
        let location = slot.location.take();
        slot.alive = false;
        let retire = slot.version == u32::MAX;
        if !retire {
            slot.version += 1;
        }
        self.alive_count -= 1;
        if retire {
            self.retired += 1;
        } else {
            self.free.push_back(entity.index);
        }
        location
    }

    /// Whether `entity` is alive with a matching version.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index as usize)
            .is_some_and(|s| s.alive && s.version == entity.version)
    }

    /// Location of a live entity.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.index as usize)?;
        if slot.alive && slot.version == entity.version {
            slot.location
        } else {
            None
        }
    }

    /// Point a live entity at a new row. Returns `false` for a stale handle.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) -> bool {
        match self.live_slot_mut(entity) {
            Some(slot) => {
                slot.location = Some(location);
                true
            }
            None => false,
        }
    }

    /// The live handle currently occupying `index`, if any.
    pub fn live_entity_at(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index as usize)?;
        slot.alive.then(|| Entity::new(index, slot.version))
    }

    /// Current version of `index` (dead or alive).
    pub fn version_of(&self, index: u32) -> Option<u32> {
        self.slots.get(index as usize).map(|s| s.version)
    }

    /// Number of live entities.
    #[inline]
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// Number of slots ever allocated (live, free, or retired).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of indices waiting for reuse.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of indices retired because their version was exhausted.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// Every slot as `(index, version, alive, location)`, in index order.
    pub fn iter_slots(
        &self,
    ) -> impl Iterator<Item = (u32, u32, bool, Option<EntityLocation>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, s.version, s.alive, s.location))
    }

    fn live_slot_mut(&mut self, entity: Entity) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(entity.index as usize)?;
        (slot.alive && slot.version == entity.version).then_some(slot)
    }

    #[cfg(test)]
    pub(crate) fn force_version(&mut self, index: u32, version: u32) {
        self.slots[index as usize].version = version;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(row: u32) -> EntityLocation {
        EntityLocation {
            archetype: ArchetypeId::new(7, 0),
            chunk: ChunkId(0),
            row,
        }
    }

    #[test]
    fn allocate_unique_indices() {
        let mut dir = EntityDirectory::new();
        let mut indices: Vec<u32> = (0..100).map(|_| dir.allocate().index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert_eq!(dir.alive_count(), 100);
    }

    #[test]
    fn versions_start_at_one() {
        let mut dir = EntityDirectory::new();
        assert_eq!(dir.allocate().version(), 1);
        assert!(!dir.is_alive(Entity::new(0, 0)));
    }

    #[test]
    fn reuse_carries_strictly_greater_version() {
        let mut dir = EntityDirectory::new();
        let e0 = dir.allocate();
        dir.set_location(e0, loc(0));
        assert_eq!(dir.free(e0), Some(loc(0)));
        let e1 = dir.allocate();
        assert_eq!(e1.index(), e0.index());
        assert!(e1.version() > e0.version());
    }

    #[test]
    fn destroyed_entity_has_no_location() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate();
        dir.set_location(e, loc(3));
        dir.free(e);
        assert_eq!(dir.location(e), None);
        assert!(!dir.is_alive(e));
        let (_, _, alive, location) = dir.iter_slots().next().unwrap();
        assert!(!alive);
        assert_eq!(location, None);
    }

    #[test]
    fn stale_handle_rejected_after_reuse() {
        let mut dir = EntityDirectory::new();
        let old = dir.allocate();
        dir.free(old);
        let new = dir.allocate();
        dir.set_location(new, loc(0));
        assert!(!dir.is_alive(old));
        assert_eq!(dir.location(old), None);
        assert!(!dir.set_location(old, loc(1)));
        assert_eq!(dir.free(old), None);
        assert_eq!(dir.location(new), Some(loc(0)));
    }

    #[test]
    fn double_free_is_noop() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate();
        dir.free(e);
        assert_eq!(dir.free(e), None);
        assert_eq!(dir.alive_count(), 0);
        assert_eq!(dir.free_count(), 1);
    }

    #[test]
    fn free_list_is_fifo() {
        let mut dir = EntityDirectory::new();
        let a = dir.allocate();
        let b = dir.allocate();
        dir.free(a);
        dir.free(b);
        assert_eq!(dir.allocate().index(), a.index());
        assert_eq!(dir.allocate().index(), b.index());
    }

    #[test]
    fn exhausted_index_is_retired() {
        let mut dir = EntityDirectory::new();
        let e = dir.allocate();
        dir.force_version(e.index(), u32::MAX);
        let e = Entity::new(e.index(), u32::MAX);
        dir.free(e);
        assert_eq!(dir.retired_count(), 1);
        assert_eq!(dir.free_count(), 0);
        assert_ne!(dir.allocate().index(), e.index());
    }

    #[test]
    fn entity_bits_roundtrip() {
        let e = Entity::new(42, 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
        assert_eq!(e.to_bits() >> 32, 7);
    }
}
