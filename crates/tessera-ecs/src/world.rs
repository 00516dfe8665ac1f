//! The [`World`] is the top-level container for the ECS. It owns the entity
//! directory, the component registry, and all archetype storage.
//!
//! The immediate operations here (`spawn`, `despawn`, `insert_component`,
//! `remove_component`) mutate storage directly and need `&mut World`. They are
//! for setup, tests, and the single-threaded apply phase. While a parallel
//! phase runs, the scheduler holds the world's only mutable borrow, so
//! processors can reach storage only through their chunk view and command
//! buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archetype::{signature_hash, Archetype, ArchetypeId, ChunkId};
use crate::component::{
    CollisionPolicy, Component, ComponentHandle, ComponentManifest, ComponentRegistry,
    ComponentTypeId, ComponentValue,
};
use crate::entity::{Entity, EntityDirectory, EntityLocation};
use crate::query::Query;
use crate::view::{ChunkView, MAX_VIEW_COLUMNS};
use crate::EcsError;

static NEXT_WORLD_UID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Construction-time settings for a [`World`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Root seed for per-entity randomness.
    pub seed: u64,
    /// Rows per chunk. Must be non-zero.
    pub chunk_capacity: usize,
    /// How component type id collisions are handled.
    pub collision_policy: CollisionPolicy,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            chunk_capacity: 128,
            collision_policy: CollisionPolicy::Strict,
        }
    }
}

impl WorldConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EcsError> {
        serde_json::from_str(json).map_err(|e| EcsError::InvalidConfig(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of component values used to spawn an entity.
///
/// If the same type is added twice, the later value wins.
#[derive(Debug, Clone, Default)]
pub struct ComponentBundle {
    values: Vec<ComponentValue>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`add`](Self::add).
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    /// Add a component value.
    pub fn add<T: Component>(&mut self, value: T) {
        self.values.push(ComponentValue::new(value));
    }

    /// Add an already type-erased value.
    pub fn add_value(&mut self, value: ComponentValue) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[ComponentValue] {
        &self.values
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The ECS world: entity directory, component registry, and archetypes.
pub struct World {
    uid: u64,
    config: WorldConfig,
    registry: ComponentRegistry,
    directory: EntityDirectory,
    /// Creation order; this is the stable enumeration order for queries.
    archetypes: Vec<Archetype>,
    archetype_slots: HashMap<ArchetypeId, usize>,
    by_signature: HashMap<Box<[ComponentTypeId]>, usize>,
    /// How many archetypes have been created per signature hash value.
    hash_population: HashMap<u32, u32>,
    /// Incremented whenever an archetype is created.
    archetype_version: u64,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("uid", &self.uid)
            .field("entities", &self.directory.alive_count())
            .field("archetypes", &self.archetypes.len())
            .field("components", &self.registry.len())
            .field("archetype_version", &self.archetype_version)
            .finish()
    }
}

impl World {
    /// Create a new, empty world.
    pub fn new(config: WorldConfig) -> Result<Self, EcsError> {
        if config.chunk_capacity == 0 {
            return Err(EcsError::InvalidConfig(
                "chunk_capacity must be non-zero".to_owned(),
            ));
        }
        Ok(Self {
            uid: NEXT_WORLD_UID.fetch_add(1, Ordering::Relaxed),
            registry: ComponentRegistry::new(config.collision_policy),
            config,
            directory: EntityDirectory::new(),
            archetypes: Vec::new(),
            archetype_slots: HashMap::new(),
            by_signature: HashMap::new(),
            hash_population: HashMap::new(),
            archetype_version: 0,
        })
    }

    /// Process-unique id of this world (keys query caches).
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    #[inline]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Root seed for per-entity randomness.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    /// Read-only access to the component registry.
    #[inline]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Read-only access to the entity directory.
    #[inline]
    pub fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Register a component type, returning its typed handle.
    pub fn register_component<T: Component>(&mut self) -> Result<ComponentHandle<T>, EcsError> {
        self.registry.register::<T>()
    }

    /// Handle for an already-registered component type.
    pub fn component_handle<T: Component>(&self) -> Option<ComponentHandle<T>> {
        self.registry.lookup::<T>()
    }

    /// Checksum of the registered component set.
    pub fn manifest(&self) -> ComponentManifest {
        self.registry.manifest()
    }

    // -- archetype management -----------------------------------------------

    /// All archetypes in creation order.
    #[inline]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    #[inline]
    pub(crate) fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetype_slots.get(&id).map(|&i| &self.archetypes[i])
    }

    pub(crate) fn archetype_slot(&self, id: ArchetypeId) -> Option<usize> {
        self.archetype_slots.get(&id).copied()
    }

    /// Number of archetypes ever created (empty ones included).
    #[inline]
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Structural version: bumped every time an archetype is created.
    #[inline]
    pub fn archetype_version(&self) -> u64 {
        self.archetype_version
    }

    /// Return the unique archetype for `signature`, creating it if needed.
    ///
    /// The signature is sorted and deduplicated first; every id must be
    /// registered.
    pub fn get_or_create_archetype(
        &mut self,
        signature: &[ComponentTypeId],
    ) -> Result<ArchetypeId, EcsError> {
        let mut sorted = signature.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let slot = self.archetype_slot_for(&sorted)?;
        Ok(self.archetypes[slot].id())
    }

    /// `sorted` must already be sorted and deduplicated.
    fn archetype_slot_for(&mut self, sorted: &[ComponentTypeId]) -> Result<usize, EcsError> {
        if let Some(&slot) = self.by_signature.get(sorted) {
            return Ok(slot);
        }
        if sorted.len() > MAX_VIEW_COLUMNS {
            return Err(EcsError::SignatureTooWide {
                count: sorted.len(),
                max: MAX_VIEW_COLUMNS,
            });
        }
        let layouts = sorted
            .iter()
            .map(|id| {
                self.registry
                    .get_info(*id)
                    .cloned()
                    .ok_or_else(|| self.unknown_component(&id.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let value = signature_hash(sorted);
        let population = self.hash_population.entry(value).or_insert(0);
        let id = ArchetypeId::new(value, *population);
        *population += 1;

        let slot = self.archetypes.len();
        self.archetypes
            .push(Archetype::new(id, layouts, self.config.chunk_capacity));
        self.archetype_slots.insert(id, slot);
        self.by_signature.insert(sorted.into(), slot);
        self.archetype_version += 1;
        debug!(
            archetype = %id,
            components = sorted.len(),
            version = self.archetype_version,
            "created archetype"
        );
        Ok(slot)
    }

    fn unknown_component(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.registry.registered_names().join(", "),
        }
    }

    /// Resolve type-erased values to `(id -> bytes)`, later duplicates winning.
    fn resolve_values<'v>(
        &self,
        values: &'v [ComponentValue],
    ) -> Result<BTreeMap<ComponentTypeId, &'v [u8]>, EcsError> {
        let mut resolved = BTreeMap::new();
        for value in values {
            let id = self
                .registry
                .lookup_type_id(value.type_id)
                .ok_or_else(|| self.unknown_component(value.type_name))?;
            resolved.insert(id, value.bytes.as_slice());
        }
        Ok(resolved)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn a new entity from a [`ComponentBundle`].
    ///
    /// Nothing is allocated if any component in the bundle is unregistered.
    pub fn spawn(&mut self, bundle: ComponentBundle) -> Result<Entity, EcsError> {
        self.spawn_values(bundle.values())
    }

    /// Spawn an entity with no components.
    pub fn spawn_empty(&mut self) -> Result<Entity, EcsError> {
        self.spawn_values(&[])
    }

    pub(crate) fn spawn_values(&mut self, values: &[ComponentValue]) -> Result<Entity, EcsError> {
        let resolved = self.resolve_values(values)?;
        let signature: Vec<ComponentTypeId> = resolved.keys().copied().collect();
        let slot = self.archetype_slot_for(&signature)?;

        let entity = self.directory.allocate();
        let archetype = &mut self.archetypes[slot];
        let archetype_id = archetype.id();
        let (chunk_id, row) = archetype.push_entity(entity);
        let chunk = archetype
            .chunk_mut(chunk_id)
            .ok_or(EcsError::MissingChunk {
                archetype: archetype_id,
                chunk: chunk_id,
            })?;
        for (id, bytes) in &resolved {
            chunk.write_component(row, *id, bytes)?;
        }
        let location = EntityLocation {
            archetype: archetype_id,
            chunk: chunk_id,
            row: row as u32,
        };
        self.directory.set_location(entity, location);
        Ok(entity)
    }

    /// Despawn an entity, removing its row and recycling the index.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        let location = self
            .directory
            .location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        self.directory.free(entity);
        self.remove_row(location);
        Ok(())
    }

    /// Swap-remove the row at `location` and repoint the moved entity.
    fn remove_row(&mut self, location: EntityLocation) {
        let slot = self.archetype_slots[&location.archetype];
        let moved = self.archetypes[slot].remove_row(location.chunk, location.row as usize);
        if let Some(moved) = moved {
            self.directory.set_location(moved, location);
        }
    }

    /// Insert a component on an entity. If the entity already has this
    /// component type, the value is overwritten in place. Otherwise, the
    /// entity migrates to the archetype that includes the additional type.
    pub fn insert_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        self.insert_value(entity, &ComponentValue::new(value))
    }

    pub(crate) fn insert_value(
        &mut self,
        entity: Entity,
        value: &ComponentValue,
    ) -> Result<(), EcsError> {
        let type_id = self
            .registry
            .lookup_type_id(value.type_id)
            .ok_or_else(|| self.unknown_component(value.type_name))?;
        let location = self
            .directory
            .location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let src = self.archetype_slots[&location.archetype];

        if self.archetypes[src].has_component(type_id) {
            let chunk = self.archetypes[src]
                .chunk_mut(location.chunk)
                .ok_or(EcsError::MissingChunk {
                    archetype: location.archetype,
                    chunk: location.chunk,
                })?;
            return chunk.write_component(location.row as usize, type_id, &value.bytes);
        }

        let mut signature = self.archetypes[src].signature().to_vec();
        let at = signature.partition_point(|id| *id < type_id);
        signature.insert(at, type_id);
        let new_location = self.move_entity(entity, location, &signature)?;
        let slot = self.archetype_slots[&new_location.archetype];
        let chunk = self.archetypes[slot]
            .chunk_mut(new_location.chunk)
            .ok_or(EcsError::MissingChunk {
                archetype: new_location.archetype,
                chunk: new_location.chunk,
            })?;
        chunk.write_component(new_location.row as usize, type_id, &value.bytes)
    }

    /// Remove a component type from an entity. If the entity does not have
    /// the component this is a no-op; otherwise the entity migrates to the
    /// archetype without it.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let type_id = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| self.unknown_component(T::NAME))?
            .id();
        self.remove_component_id(entity, type_id)
    }

    pub(crate) fn remove_component_id(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
    ) -> Result<(), EcsError> {
        let location = self
            .directory
            .location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let src = self.archetype_slots[&location.archetype];
        if !self.archetypes[src].has_component(type_id) {
            return Ok(());
        }
        let signature: Vec<ComponentTypeId> = self.archetypes[src]
            .signature()
            .iter()
            .copied()
            .filter(|id| *id != type_id)
            .collect();
        self.move_entity(entity, location, &signature)?;
        Ok(())
    }

    /// Append to the destination archetype, copy shared columns, swap-remove
    /// from the source, and update both affected directory entries.
    fn move_entity(
        &mut self,
        entity: Entity,
        from: EntityLocation,
        signature: &[ComponentTypeId],
    ) -> Result<EntityLocation, EcsError> {
        let dst = self.archetype_slot_for(signature)?;
        let src = self.archetype_slots[&from.archetype];
        debug_assert_ne!(dst, src);

        let (dst_arch, src_arch) = pair_mut(&mut self.archetypes, dst, src);
        let (chunk, row) = dst_arch.push_entity(entity);
        dst_arch.copy_shared_from(chunk, row, src_arch, from.chunk, from.row as usize);
        let to = EntityLocation {
            archetype: dst_arch.id(),
            chunk,
            row: row as u32,
        };

        self.remove_row(from);
        self.directory.set_location(entity, to);
        Ok(to)
    }

    // -- component access ---------------------------------------------------

    /// Get a reference to a component value.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let handle = self.registry.lookup::<T>()?;
        let location = self.directory.location(entity)?;
        let chunk = self.archetype(location.archetype)?.chunk(location.chunk)?;
        let col = chunk.column_index(handle.id())?;
        chunk
            .column_span::<T>(col)
            .ok()?
            .get(location.row as usize)
    }

    /// Get a mutable reference to a component value.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let handle = self.registry.lookup::<T>()?;
        let location = self.directory.location(entity)?;
        let slot = self.archetype_slot(location.archetype)?;
        let chunk = self.archetypes[slot].chunk_mut(location.chunk)?;
        let col = chunk.column_index(handle.id())?;
        chunk
            .column_span_mut::<T>(col)
            .ok()?
            .get_mut(location.row as usize)
    }

    /// Get a component the caller knows is present.
    ///
    /// # Panics
    ///
    /// Panics if the entity is dead or does not carry `T`.
    pub fn get_strict<T: Component>(&self, entity: Entity) -> &T {
        match self.get::<T>(entity) {
            Some(value) => value,
            None => panic!(
                "get_strict: entity {entity} is not alive or has no {}::{}",
                T::MODULE,
                T::NAME
            ),
        }
    }

    /// Whether the entity is alive and carries `T`.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        let Some(handle) = self.registry.lookup::<T>() else {
            return false;
        };
        self.directory
            .location(entity)
            .and_then(|loc| self.archetype(loc.archetype))
            .is_some_and(|arch| arch.has_component(handle.id()))
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.directory.is_alive(entity)
    }

    /// Where a live entity's row is stored.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.directory.location(entity)
    }

    /// Number of live entities.
    #[inline]
    pub fn entity_count(&self) -> usize {
        self.directory.alive_count()
    }

    // -- iteration ----------------------------------------------------------

    /// Run `f` once per non-empty chunk matching `query`, in archetype
    /// creation order then chunk order. Stops at the first error.
    pub fn for_each_chunk<E, F>(&mut self, query: &mut Query, mut f: F) -> Result<(), E>
    where
        F: FnMut(&ChunkView<'_>) -> Result<(), E>,
    {
        let matching = query.matching_archetype_slots(self).to_vec();
        for slot in matching {
            for chunk in self.archetypes[slot].chunks_mut() {
                if chunk.is_empty() {
                    continue;
                }
                let view = ChunkView::new(chunk);
                f(&view)?;
            }
        }
        Ok(())
    }

    /// Entities matching `query`, in storage order.
    pub fn entities(&self, query: &mut Query) -> Vec<Entity> {
        let mut out = Vec::new();
        for slot in query.matching_archetype_slots(self) {
            for chunk in self.archetypes[*slot].chunks() {
                out.extend_from_slice(chunk.entities());
            }
        }
        out
    }

    /// Raw bytes of one component of a live entity (for digests and debug).
    pub(crate) fn component_bytes(&self, entity: Entity, id: ComponentTypeId) -> Option<&[u8]> {
        let location = self.directory.location(entity)?;
        self.archetype(location.archetype)?
            .chunk(location.chunk)?
            .component_bytes(location.row as usize, id)
    }

    pub(crate) fn chunk_at(&self, archetype: ArchetypeId, chunk: ChunkId) -> Option<&crate::archetype::Chunk> {
        self.archetype(archetype)?.chunk(chunk)
    }
}

/// Borrow two distinct elements, one mutably.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &left[b])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Pos {
        x: f32,
        y: f32,
    }
    crate::component!(Pos);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Vel {
        dx: f32,
        dy: f32,
    }
    crate::component!(Vel);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Unregistered(u32);
    crate::component!(Unregistered);

    fn setup_world() -> World {
        let mut world = World::new(WorldConfig {
            chunk_capacity: 4,
            ..WorldConfig::default()
        })
        .unwrap();
        world.register_component::<Pos>().unwrap();
        world.register_component::<Vel>().unwrap();
        world
    }

    fn pos(x: f32) -> Pos {
        Pos { x, y: 0.0 }
    }

    #[test]
    fn zero_chunk_capacity_rejected() {
        let err = World::new(WorldConfig {
            chunk_capacity: 0,
            ..WorldConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, EcsError::InvalidConfig(_)));
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config = WorldConfig::from_json(r#"{ "seed": 7, "collision_policy": "probe" }"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.chunk_capacity, 128);
        assert_eq!(config.collision_policy, CollisionPolicy::Probe);
        assert!(WorldConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn spawn_and_get() {
        let mut world = setup_world();
        let e = world
            .spawn(ComponentBundle::new().with(pos(1.0)).with(Vel { dx: 2.0, dy: 3.0 }))
            .unwrap();
        assert_eq!(world.get::<Pos>(e), Some(&pos(1.0)));
        assert_eq!(world.get::<Vel>(e), Some(&Vel { dx: 2.0, dy: 3.0 }));
        assert!(world.has::<Vel>(e));
    }

    #[test]
    fn duplicate_bundle_entry_last_wins() {
        let mut world = setup_world();
        let e = world
            .spawn(ComponentBundle::new().with(pos(1.0)).with(pos(2.0)))
            .unwrap();
        assert_eq!(world.get::<Pos>(e), Some(&pos(2.0)));
        assert_eq!(world.archetype(world.location(e).unwrap().archetype).unwrap().signature().len(), 1);
    }

    #[test]
    fn unregistered_component_spawns_nothing() {
        let mut world = setup_world();
        let err = world
            .spawn(ComponentBundle::new().with(pos(1.0)).with(Unregistered(1)))
            .unwrap_err();
        assert!(matches!(err, EcsError::UnknownComponent { .. }));
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.directory().capacity(), 0);
    }

    #[test]
    fn despawn_invalidates_location() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(pos(0.0))).unwrap();
        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));
        assert_eq!(world.location(e), None);
        assert_eq!(world.get::<Pos>(e), None);
        assert!(matches!(world.despawn(e), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn despawn_repoints_swapped_entity() {
        let mut world = setup_world();
        let a = world.spawn(ComponentBundle::new().with(pos(0.0))).unwrap();
        let b = world.spawn(ComponentBundle::new().with(pos(1.0))).unwrap();
        let c = world.spawn(ComponentBundle::new().with(pos(2.0))).unwrap();
        world.despawn(a).unwrap();
        assert_eq!(world.location(c).unwrap().row, 0);
        assert_eq!(world.get::<Pos>(c), Some(&pos(2.0)));
        assert_eq!(world.get::<Pos>(b), Some(&pos(1.0)));
    }

    #[test]
    fn reused_index_has_greater_version() {
        let mut world = setup_world();
        let a = world.spawn_empty().unwrap();
        world.despawn(a).unwrap();
        let b = world.spawn_empty().unwrap();
        assert_eq!(a.index(), b.index());
        assert!(b.version() > a.version());
        assert!(!world.is_alive(a));
        assert!(world.is_alive(b));
    }

    #[test]
    fn insert_component_migrates_and_keeps_values() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(pos(5.0))).unwrap();
        let before = world.archetype_count();
        world.insert_component(e, Vel { dx: 1.0, dy: 1.0 }).unwrap();
        assert_eq!(world.archetype_count(), before + 1);
        assert_eq!(world.get::<Pos>(e), Some(&pos(5.0)));
        assert_eq!(world.get::<Vel>(e), Some(&Vel { dx: 1.0, dy: 1.0 }));
    }

    #[test]
    fn insert_existing_component_overwrites_in_place() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(pos(5.0))).unwrap();
        let location = world.location(e);
        world.insert_component(e, pos(6.0)).unwrap();
        assert_eq!(world.location(e), location);
        assert_eq!(world.get::<Pos>(e), Some(&pos(6.0)));
    }

    #[test]
    fn remove_component_migrates_and_swaps_source() {
        let mut world = setup_world();
        let bundle = |x| ComponentBundle::new().with(pos(x)).with(Vel { dx: x, dy: x });
        let a = world.spawn(bundle(1.0)).unwrap();
        let b = world.spawn(bundle(2.0)).unwrap();
        world.remove_component::<Vel>(a).unwrap();
        assert!(!world.has::<Vel>(a));
        assert_eq!(world.get::<Pos>(a), Some(&pos(1.0)));
        // b was swapped into a's old row.
        assert_eq!(world.location(b).unwrap().row, 0);
        assert_eq!(world.get::<Vel>(b), Some(&Vel { dx: 2.0, dy: 2.0 }));
        // Removing an absent component is a no-op.
        world.remove_component::<Vel>(a).unwrap();
    }

    #[test]
    fn get_mut_modifies() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(pos(0.0))).unwrap();
        world.get_mut::<Pos>(e).unwrap().x = 42.0;
        assert_eq!(world.get_strict::<Pos>(e).x, 42.0);
    }

    #[test]
    #[should_panic(expected = "get_strict")]
    fn get_strict_panics_when_absent() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(pos(0.0))).unwrap();
        world.get_strict::<Vel>(e);
    }

    #[test]
    fn archetype_is_unique_per_signature() {
        let mut world = setup_world();
        let p = world.component_handle::<Pos>().unwrap().id();
        let v = world.component_handle::<Vel>().unwrap().id();
        let a = world.get_or_create_archetype(&[p, v]).unwrap();
        let b = world.get_or_create_archetype(&[v, p, v]).unwrap();
        assert_eq!(a, b);
        assert_eq!(world.archetype_version(), 1);
        assert!(matches!(
            world.get_or_create_archetype(&[ComponentTypeId(12345)]),
            Err(EcsError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn chunks_fill_then_append() {
        let mut world = setup_world();
        let entities: Vec<Entity> = (0..10)
            .map(|i| world.spawn(ComponentBundle::new().with(pos(i as f32))).unwrap())
            .collect();
        let arch = world.archetype(world.location(entities[0]).unwrap().archetype).unwrap();
        assert_eq!(arch.chunks().len(), 3);
        assert_eq!(world.location(entities[9]).unwrap().chunk, ChunkId(2));
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(world.get::<Pos>(*e), Some(&pos(i as f32)));
        }
    }

    #[test]
    fn independent_worlds_have_independent_registries() {
        let mut a = World::new(WorldConfig::default()).unwrap();
        let b = World::new(WorldConfig::default()).unwrap();
        a.register_component::<Pos>().unwrap();
        assert!(b.component_handle::<Pos>().is_none());
        assert_ne!(a.uid(), b.uid());
    }
}
