//! Deferred structural mutation.
//!
//! A [`CommandBuffer`] records entity creation, component addition and
//! removal, and entity destruction without touching storage. Each command
//! carries a caller-supplied [`SortKey`]. When buffers from several workers
//! are concatenated and applied, commands replay in ascending key order, with
//! ties broken by position in the concatenated log (assigned at apply time).
//! Keys must therefore come from data that is stable across runs, such as
//! `(tick, entity index, lane)`; never from thread identity, timing, or the
//! order in which a worker happened to emit commands.
//!
//! # Example
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! #[repr(C)]
//! struct Health(u32);
//! tessera_ecs::component!(Health);
//!
//! let mut world = World::new(WorldConfig::default()).unwrap();
//! world.register_component::<Health>().unwrap();
//! let entity = world.spawn(ComponentBundle::new().with(Health(100))).unwrap();
//!
//! let mut cmds = CommandBuffer::new(0);
//! cmds.add_component(entity, Health(40), SortKey::for_entity(1, entity.index(), 1));
//! cmds.add_component(entity, Health(50), SortKey::for_entity(1, entity.index(), 0));
//!
//! let report = cmds.apply(&mut world);
//! assert_eq!(report.success_count, 2);
//! assert_eq!(world.get::<Health>(entity), Some(&Health(40)));
//! ```

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU64;

use tracing::warn;

use crate::component::{Component, ComponentValue};
use crate::entity::Entity;
use crate::world::{ComponentBundle, World};
use crate::EcsError;

// ---------------------------------------------------------------------------
// SortKey
// ---------------------------------------------------------------------------

/// Non-zero ordering key for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortKey(NonZeroU64);

impl SortKey {
    /// `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Compose a key from a tick, an entity index, and a lane that orders
    /// several commands issued for the same entity on the same tick.
    ///
    /// Layout (before the `+ 1` that keeps it non-zero): 23 bits of tick,
    /// 32 bits of entity index, 8 bits of lane. Keys order by tick first,
    /// then entity, then lane.
    pub fn for_entity(tick: u64, entity_index: u32, lane: u8) -> Self {
        let raw = ((tick & 0x7F_FFFF) << 40) | (u64::from(entity_index) << 8) | u64::from(lane);
        Self(NonZeroU64::MIN.saturating_add(raw))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

// ---------------------------------------------------------------------------
// PendingEntity / EntityRef
// ---------------------------------------------------------------------------

/// Placeholder for an entity a buffer will create when applied.
///
/// Unique across buffers as long as each worker's buffer has a distinct id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingEntity {
    buffer: u32,
    local: u32,
}

impl PendingEntity {
    /// Id of the buffer that recorded the creation.
    pub fn buffer(self) -> u32 {
        self.buffer
    }

    /// Sequence number within that buffer.
    pub fn local(self) -> u32 {
        self.local
    }
}

/// A command target: a live entity, or one created earlier in the same
/// applied log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    Live(Entity),
    Pending(PendingEntity),
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::Live(entity)
    }
}

impl From<PendingEntity> for EntityRef {
    fn from(pending: PendingEntity) -> Self {
        EntityRef::Pending(pending)
    }
}

// ---------------------------------------------------------------------------
// CommandKind / Command
// ---------------------------------------------------------------------------

/// The data payload for a command -- what mutation to perform.
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// Create an entity with the given components (possibly none).
    CreateEntity {
        pending: PendingEntity,
        components: Vec<ComponentValue>,
    },
    /// Insert or overwrite a component.
    AddComponent { target: EntityRef, value: ComponentValue },
    /// Remove a component if present.
    RemoveComponent {
        target: EntityRef,
        type_id: TypeId,
        type_name: &'static str,
    },
    /// Destroy an entity.
    DestroyEntity { target: EntityRef },
}

impl CommandKind {
    fn target(&self) -> Option<EntityRef> {
        match self {
            CommandKind::CreateEntity { .. } => None,
            CommandKind::AddComponent { target, .. }
            | CommandKind::RemoveComponent { target, .. }
            | CommandKind::DestroyEntity { target } => Some(*target),
        }
    }

    /// Component written by this command, for conflict detection.
    fn written_component(&self) -> Option<(TypeId, &'static str)> {
        match self {
            CommandKind::AddComponent { value, .. } => Some((value.type_id(), value.type_name())),
            CommandKind::RemoveComponent {
                type_id, type_name, ..
            } => Some((*type_id, type_name)),
            _ => None,
        }
    }
}

/// A single deferred mutation and its ordering key.
#[derive(Debug, Clone)]
pub struct Command {
    pub sort_key: SortKey,
    pub kind: CommandKind,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one [`CommandBuffer::apply`] call.
///
/// `conflict_count` counts (entity, component) pairs targeted by more than
/// one write in the applied log; the highest key wins and conflicts are
/// warnings, not errors. `failed_count` counts commands that could not be
/// applied (stale target, unresolved pending entity, unregistered
/// component); they are logged and skipped, never retried.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Number of (entity, component) pairs targeted by multiple commands.
    pub conflict_count: usize,
    /// Number of commands that failed to apply.
    pub failed_count: usize,
    /// Number of commands that applied successfully.
    pub success_count: usize,
    /// Entities created, in apply order.
    pub created: Vec<(PendingEntity, Entity)>,
}

impl ApplyReport {
    /// The entity a pending placeholder resolved to.
    pub fn created_entity(&self, pending: PendingEntity) -> Option<Entity> {
        self.created
            .iter()
            .find(|(p, _)| *p == pending)
            .map(|(_, e)| *e)
    }

    /// Fold another report into this one.
    pub fn absorb(&mut self, other: ApplyReport) {
        self.conflict_count += other.conflict_count;
        self.failed_count += other.failed_count;
        self.success_count += other.success_count;
        self.created.extend(other.created);
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// A worker-local log of structural mutations.
#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    id: u32,
    commands: Vec<Command>,
    next_local: u32,
}

impl CommandBuffer {
    /// Create an empty buffer. `id` namespaces the pending entities it
    /// creates; give every concurrently used buffer a distinct id.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            commands: Vec::new(),
            next_local: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue creation of an entity with no components.
    pub fn create_entity(&mut self, sort_key: SortKey) -> PendingEntity {
        self.create_entity_with(ComponentBundle::new(), sort_key)
    }

    /// Queue creation of an entity with initial components.
    pub fn create_entity_with(&mut self, bundle: ComponentBundle, sort_key: SortKey) -> PendingEntity {
        let pending = PendingEntity {
            buffer: self.id,
            local: self.next_local,
        };
        self.next_local += 1;
        self.push(
            sort_key,
            CommandKind::CreateEntity {
                pending,
                components: bundle.values().to_vec(),
            },
        );
        pending
    }

    /// Queue an insert-or-overwrite of component `T`.
    pub fn add_component<T: Component>(
        &mut self,
        target: impl Into<EntityRef>,
        value: T,
        sort_key: SortKey,
    ) {
        self.push(
            sort_key,
            CommandKind::AddComponent {
                target: target.into(),
                value: ComponentValue::new(value),
            },
        );
    }

    /// Queue removal of component `T`.
    pub fn remove_component<T: Component>(&mut self, target: impl Into<EntityRef>, sort_key: SortKey) {
        self.push(
            sort_key,
            CommandKind::RemoveComponent {
                target: target.into(),
                type_id: TypeId::of::<T>(),
                type_name: T::NAME,
            },
        );
    }

    /// Queue destruction of an entity.
    pub fn destroy_entity(&mut self, target: impl Into<EntityRef>, sort_key: SortKey) {
        self.push(
            sort_key,
            CommandKind::DestroyEntity {
                target: target.into(),
            },
        );
    }

    fn push(&mut self, sort_key: SortKey, kind: CommandKind) {
        self.commands.push(Command { sort_key, kind });
    }

    /// Queued commands in recording order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop all queued commands.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.next_local = 0;
    }

    /// Move `other`'s commands onto the end of this log.
    pub fn append(&mut self, other: &mut CommandBuffer) {
        self.commands.append(&mut other.commands);
    }

    /// Concatenate buffers in the given order (worker-index order).
    pub fn concat(buffers: impl IntoIterator<Item = CommandBuffer>) -> CommandBuffer {
        let mut merged = CommandBuffer::new(u32::MAX);
        for mut buffer in buffers {
            merged.append(&mut buffer);
        }
        merged
    }

    /// Replay the log against `world` in `(sort key, position)` order and
    /// empty the buffer.
    ///
    /// Commands that fail are logged and counted in the report; the rest
    /// still apply.
    pub fn apply(&mut self, world: &mut World) -> ApplyReport {
        let commands = std::mem::take(&mut self.commands);
        self.next_local = 0;

        // Sequence numbers are assigned here, over the concatenated log.
        let mut ordered: Vec<(SortKey, usize, Command)> = commands
            .into_iter()
            .enumerate()
            .map(|(seq, cmd)| (cmd.sort_key, seq, cmd))
            .collect();
        ordered.sort_by_key(|(key, seq, _)| (*key, *seq));

        let mut report = ApplyReport {
            conflict_count: Self::detect_conflicts(&ordered),
            ..ApplyReport::default()
        };

        let mut resolved: HashMap<PendingEntity, Entity> = HashMap::new();
        for (key, seq, cmd) in &ordered {
            let result = Self::apply_one(world, &cmd.kind, &mut resolved, &mut report);
            match result {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    report.failed_count += 1;
                    warn!(
                        sort_key = key.get(),
                        sequence = *seq,
                        target = ?cmd.kind.target(),
                        error = %e,
                        "command application failed"
                    );
                }
            }
        }
        report
    }

    fn apply_one(
        world: &mut World,
        kind: &CommandKind,
        resolved: &mut HashMap<PendingEntity, Entity>,
        report: &mut ApplyReport,
    ) -> Result<(), EcsError> {
        let resolve = |target: &EntityRef| match target {
            EntityRef::Live(entity) => Ok(*entity),
            EntityRef::Pending(pending) => resolved
                .get(pending)
                .copied()
                .ok_or(EcsError::UnresolvedPendingEntity { pending: *pending }),
        };
        match kind {
            CommandKind::CreateEntity {
                pending,
                components,
            } => {
                let entity = world.spawn_values(components)?;
                resolved.insert(*pending, entity);
                report.created.push((*pending, entity));
                Ok(())
            }
            CommandKind::AddComponent { target, value } => {
                let entity = resolve(target)?;
                world.insert_value(entity, value)
            }
            CommandKind::RemoveComponent {
                target,
                type_id,
                type_name,
            } => {
                let entity = resolve(target)?;
                let id = world.registry().lookup_type_id(*type_id).ok_or_else(|| {
                    EcsError::UnknownComponent {
                        name: (*type_name).to_owned(),
                        registered: world.registry().registered_names().join(", "),
                    }
                })?;
                world.remove_component_id(entity, id)
            }
            CommandKind::DestroyEntity { target } => {
                let entity = resolve(target)?;
                world.despawn(entity)
            }
        }
    }

    /// Count (target, component) pairs written more than once.
    fn detect_conflicts(ordered: &[(SortKey, usize, Command)]) -> usize {
        let mut seen: BTreeMap<(EntityRef, TypeId), (&'static str, Vec<u64>)> = BTreeMap::new();
        for (key, _, cmd) in ordered {
            if let (Some(target), Some((type_id, name))) =
                (cmd.kind.target(), cmd.kind.written_component())
            {
                seen.entry((target, type_id))
                    .or_insert_with(|| (name, Vec::new()))
                    .1
                    .push(key.get());
            }
        }
        let mut conflict_count = 0;
        for ((target, _), (component, keys)) in &seen {
            if keys.len() > 1 {
                conflict_count += 1;
                warn!(
                    target = ?target,
                    component = %component,
                    sort_keys = ?keys,
                    "conflict: {} commands target the same entity+component (highest key wins)",
                    keys.len()
                );
            }
        }
        conflict_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Health(u32);
    crate::component!(Health);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Marker(u32);
    crate::component!(Marker);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Unregistered(u32);
    crate::component!(Unregistered);

    fn setup_world() -> World {
        let mut world = World::new(WorldConfig::default()).unwrap();
        world.register_component::<Health>().unwrap();
        world.register_component::<Marker>().unwrap();
        world
    }

    fn key(raw: u64) -> SortKey {
        SortKey::new(raw).unwrap()
    }

    #[test]
    fn sort_key_rejects_zero() {
        assert!(SortKey::new(0).is_none());
        assert_eq!(SortKey::new(5).unwrap().get(), 5);
    }

    #[test]
    fn sort_key_for_entity_orders_tick_then_index_then_lane() {
        assert!(SortKey::for_entity(0, 0, 0).get() > 0);
        assert!(SortKey::for_entity(1, 0, 0) > SortKey::for_entity(0, u32::MAX, 255));
        assert!(SortKey::for_entity(3, 2, 0) > SortKey::for_entity(3, 1, 255));
        assert!(SortKey::for_entity(3, 1, 1) > SortKey::for_entity(3, 1, 0));
    }

    #[test]
    fn recording_does_not_touch_world() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(Health(1))).unwrap();
        let mut cmds = CommandBuffer::new(0);
        cmds.add_component(e, Health(9), key(1));
        cmds.create_entity(key(2));
        cmds.destroy_entity(e, key(3));
        assert_eq!(world.get::<Health>(e), Some(&Health(1)));
        assert_eq!(world.entity_count(), 1);
        assert_eq!(cmds.len(), 3);
    }

    #[test]
    fn apply_follows_sort_key_not_recording_order() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(Health(0))).unwrap();
        let mut cmds = CommandBuffer::new(0);
        cmds.add_component(e, Health(30), key(30));
        cmds.add_component(e, Health(10), key(10));
        cmds.add_component(e, Health(20), key(20));
        let report = cmds.apply(&mut world);
        assert_eq!(world.get::<Health>(e), Some(&Health(30)));
        assert_eq!(report.success_count, 3);
        assert_eq!(report.conflict_count, 1);
        assert!(cmds.is_empty());
    }

    #[test]
    fn equal_keys_fall_back_to_concatenation_order() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(Health(0))).unwrap();
        let mut first = CommandBuffer::new(0);
        let mut second = CommandBuffer::new(1);
        first.add_component(e, Health(1), key(7));
        second.add_component(e, Health(2), key(7));
        let mut merged = CommandBuffer::concat([first, second]);
        merged.apply(&mut world);
        assert_eq!(world.get::<Health>(e), Some(&Health(2)));
    }

    #[test]
    fn pending_entity_can_be_targeted_later_in_the_log() {
        let mut world = setup_world();
        let mut cmds = CommandBuffer::new(3);
        let pending = cmds.create_entity_with(ComponentBundle::new().with(Health(5)), key(1));
        cmds.add_component(pending, Marker(8), key(2));
        let report = cmds.apply(&mut world);
        assert_eq!(report.failed_count, 0);
        let entity = report.created_entity(pending).unwrap();
        assert_eq!(world.get::<Health>(entity), Some(&Health(5)));
        assert_eq!(world.get::<Marker>(entity), Some(&Marker(8)));
        assert_eq!(pending.buffer(), 3);
    }

    #[test]
    fn pending_entity_targeted_before_creation_fails() {
        let mut world = setup_world();
        let mut cmds = CommandBuffer::new(0);
        let pending = cmds.create_entity(key(5));
        cmds.add_component(pending, Marker(1), key(4));
        let report = cmds.apply(&mut world);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.success_count, 1);
        let entity = report.created_entity(pending).unwrap();
        assert!(!world.has::<Marker>(entity));
    }

    #[test]
    fn stale_targets_are_counted_not_applied() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(Health(1))).unwrap();
        world.despawn(e).unwrap();
        let mut cmds = CommandBuffer::new(0);
        cmds.add_component(e, Health(2), key(1));
        cmds.destroy_entity(e, key(2));
        let report = cmds.apply(&mut world);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.success_count, 0);
    }

    #[test]
    fn destroy_then_add_fails_the_add() {
        let mut world = setup_world();
        let e = world.spawn(ComponentBundle::new().with(Health(1))).unwrap();
        let mut cmds = CommandBuffer::new(0);
        cmds.destroy_entity(e, key(1));
        cmds.add_component(e, Marker(1), key(2));
        let report = cmds.apply(&mut world);
        assert!(!world.is_alive(e));
        assert_eq!(report.failed_count, 1);
    }

    #[test]
    fn remove_component_via_command() {
        let mut world = setup_world();
        let e = world
            .spawn(ComponentBundle::new().with(Health(1)).with(Marker(2)))
            .unwrap();
        let mut cmds = CommandBuffer::new(0);
        cmds.remove_component::<Marker>(e, key(1));
        cmds.remove_component::<Unregistered>(e, key(2));
        let report = cmds.apply(&mut world);
        assert!(!world.has::<Marker>(e));
        assert_eq!(world.get::<Health>(e), Some(&Health(1)));
        assert_eq!(report.failed_count, 1);
    }

    #[test]
    fn concatenation_order_does_not_change_result() {
        fn build(world: &World) -> (CommandBuffer, CommandBuffer) {
            let entities: Vec<Entity> = (0..4)
                .map(|i| world.directory().live_entity_at(i).unwrap())
                .collect();
            let mut a = CommandBuffer::new(0);
            let mut b = CommandBuffer::new(1);
            a.add_component(entities[0], Marker(1), key(10));
            b.add_component(entities[1], Marker(2), key(11));
            a.destroy_entity(entities[2], key(12));
            b.create_entity_with(ComponentBundle::new().with(Health(77)), key(13));
            a.create_entity_with(ComponentBundle::new().with(Health(88)), key(14));
            b.add_component(entities[3], Health(99), key(15));
            (a, b)
        }
        fn run(swap: bool) -> Vec<(Entity, Option<Health>, Option<Marker>)> {
            let mut world = setup_world();
            for i in 0..4 {
                world.spawn(ComponentBundle::new().with(Health(i))).unwrap();
            }
            let (a, b) = build(&world);
            let mut merged = if swap {
                CommandBuffer::concat([b, a])
            } else {
                CommandBuffer::concat([a, b])
            };
            merged.apply(&mut world);
            let mut query = Query::new();
            let mut out: Vec<_> = world
                .entities(&mut query)
                .into_iter()
                .map(|e| (e, world.get::<Health>(e).copied(), world.get::<Marker>(e).copied()))
                .collect();
            out.sort_by_key(|(e, _, _)| *e);
            out
        }
        assert_eq!(run(false), run(true));
    }
}
