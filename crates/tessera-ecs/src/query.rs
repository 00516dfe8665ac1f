//! Archetype queries.
//!
//! A [`Query`] names the component types an archetype must have (`all`) and
//! must not have (`none`). Both sets are kept sorted and deduplicated, so two
//! queries built in different orders compare equal and hash equally.
//!
//! Matching works on archetypes, never on entities. The list of matching
//! archetypes is cached inside the query and keyed to the world's
//! [`archetype_version`](crate::world::World::archetype_version): when a new
//! archetype appears the cache is stale and is rebuilt on next use by one scan
//! over all archetypes in creation order. Query cost is therefore bounded by
//! the archetype count regardless of how many entities exist.

use tracing::debug;

use crate::archetype::Archetype;
use crate::component::{ComponentHandle, ComponentTypeId};
use crate::world::World;

// ---------------------------------------------------------------------------
// QueryDesc
// ---------------------------------------------------------------------------

/// Normalized `all` / `none` component sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryDesc {
    all: Vec<ComponentTypeId>,
    none: Vec<ComponentTypeId>,
}

impl QueryDesc {
    /// Build from unsorted, possibly duplicated id lists.
    pub fn new(all: &[ComponentTypeId], none: &[ComponentTypeId]) -> Self {
        Self {
            all: normalized(all),
            none: normalized(none),
        }
    }

    /// Required ids, sorted.
    pub fn all(&self) -> &[ComponentTypeId] {
        &self.all
    }

    /// Excluded ids, sorted.
    pub fn none(&self) -> &[ComponentTypeId] {
        &self.none
    }

    /// True iff every `all` id is in `signature` and no `none` id is.
    ///
    /// `signature` must be sorted.
    pub fn matches(&self, signature: &[ComponentTypeId]) -> bool {
        self.all.iter().all(|id| signature.binary_search(id).is_ok())
            && !self.none.iter().any(|id| signature.binary_search(id).is_ok())
    }

    fn insert_all(&mut self, id: ComponentTypeId) {
        insert_sorted(&mut self.all, id);
    }

    fn insert_none(&mut self, id: ComponentTypeId) {
        insert_sorted(&mut self.none, id);
    }
}

fn normalized(ids: &[ComponentTypeId]) -> Vec<ComponentTypeId> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

fn insert_sorted(ids: &mut Vec<ComponentTypeId>, id: ComponentTypeId) {
    if let Err(at) = ids.binary_search(&id) {
        ids.insert(at, id);
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct QueryCache {
    /// `None` until first use or after the description changed.
    key: Option<(u64, u64)>,
    /// Indices into `World::archetypes`, in creation order.
    slots: Vec<usize>,
    rebuilds: u64,
}

/// A query description plus its cached archetype matches.
///
/// ```
/// use tessera_ecs::prelude::*;
///
/// #[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
/// #[repr(C)]
/// struct Health(u32);
/// tessera_ecs::component!(Health);
///
/// let mut world = World::new(WorldConfig::default()).unwrap();
/// let health = world.register_component::<Health>().unwrap();
/// world.spawn(ComponentBundle::new().with(Health(10))).unwrap();
///
/// let mut query = Query::new().all(health);
/// assert_eq!(query.entity_count(&world), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
    desc: QueryDesc,
    cache: QueryCache,
}

impl Query {
    /// An empty query (matches every archetype).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_desc(desc: QueryDesc) -> Self {
        Self {
            desc,
            cache: QueryCache::default(),
        }
    }

    /// Require component `T`.
    pub fn all<T>(self, handle: ComponentHandle<T>) -> Self {
        self.all_id(handle.id())
    }

    /// Exclude component `T`.
    pub fn none<T>(self, handle: ComponentHandle<T>) -> Self {
        self.none_id(handle.id())
    }

    pub fn all_id(mut self, id: ComponentTypeId) -> Self {
        self.desc.insert_all(id);
        self.cache.key = None;
        self
    }

    pub fn none_id(mut self, id: ComponentTypeId) -> Self {
        self.desc.insert_none(id);
        self.cache.key = None;
        self
    }

    #[inline]
    pub fn desc(&self) -> &QueryDesc {
        &self.desc
    }

    /// Whether `archetype` satisfies this query.
    #[inline]
    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.desc.matches(archetype.signature())
    }

    /// Whether the cache must be rebuilt before it can serve `world`.
    pub fn is_stale(&self, world: &World) -> bool {
        self.cache.key != Some((world.uid(), world.archetype_version()))
    }

    /// How many times the cache has been rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.cache.rebuilds
    }

    /// Indices into [`World::archetypes`] of every matching archetype, empty
    /// ones included, in creation order.
    pub fn matching_archetype_slots(&mut self, world: &World) -> &[usize] {
        if self.is_stale(world) {
            self.rebuild(world);
        }
        &self.cache.slots
    }

    fn rebuild(&mut self, world: &World) {
        self.cache.slots.clear();
        for (slot, archetype) in world.archetypes().iter().enumerate() {
            if self.desc.matches(archetype.signature()) {
                self.cache.slots.push(slot);
            }
        }
        self.cache.key = Some((world.uid(), world.archetype_version()));
        self.cache.rebuilds += 1;
        debug!(
            world = world.uid(),
            version = world.archetype_version(),
            archetypes_scanned = world.archetype_count(),
            matched = self.cache.slots.len(),
            "rebuilt query cache"
        );
    }

    /// Matching archetypes that currently hold at least one entity.
    pub fn matching_archetypes<'w>(&mut self, world: &'w World) -> Vec<&'w Archetype> {
        let archetypes = world.archetypes();
        self.matching_archetype_slots(world)
            .iter()
            .map(|&slot| &archetypes[slot])
            .filter(|archetype| !archetype.is_empty())
            .collect()
    }

    /// Number of live entities matched.
    pub fn entity_count(&mut self, world: &World) -> usize {
        let archetypes = world.archetypes();
        self.matching_archetype_slots(world)
            .iter()
            .map(|&slot| archetypes[slot].len())
            .sum()
    }

    /// Number of non-empty chunks matched.
    pub fn chunk_count(&mut self, world: &World) -> usize {
        self.matching_archetypes(world)
            .iter()
            .map(|a| a.chunks().iter().filter(|c| !c.is_empty()).count())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
