//! Property tests for command buffer operations.
//!
//! These tests use `proptest` to generate random sequences of command buffer
//! operations and verify that invariants hold after applying each sequence.

use proptest::prelude::*;
use tessera_ecs::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C)]
struct Hp(u32);
tessera_ecs::component!(Hp);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C)]
struct Score(i64);
tessera_ecs::component!(Score);

#[derive(Debug, Clone)]
enum CmdOp {
    SetHp(usize, u32),
    SetScore(usize, i64),
    RemoveHp(usize),
    Despawn(usize),
    Spawn(u32),
    SpawnThenScore(u32, i64),
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        (0..20usize, any::<u32>()).prop_map(|(i, v)| CmdOp::SetHp(i, v)),
        (0..20usize, any::<i64>()).prop_map(|(i, v)| CmdOp::SetScore(i, v)),
        (0..20usize).prop_map(CmdOp::RemoveHp),
        (0..20usize).prop_map(CmdOp::Despawn),
        any::<u32>().prop_map(CmdOp::Spawn),
        (any::<u32>(), any::<i64>()).prop_map(|(h, s)| CmdOp::SpawnThenScore(h, s)),
    ]
}

/// Distinct key per (op position, lane): positions are scattered so key
/// order differs from recording order.
fn key_for(position: usize, lane: u64) -> SortKey {
    let scattered = (position as u64 * 7919) % 1009;
    SortKey::new(scattered * 4 + lane + 1).unwrap()
}

/// Record one op into `buf`.
fn record(buf: &mut CommandBuffer, position: usize, op: &CmdOp, entities: &[Entity]) {
    let pick = |idx: usize| entities[idx % entities.len()];
    match op {
        CmdOp::SetHp(idx, val) => buf.add_component(pick(*idx), Hp(*val), key_for(position, 0)),
        CmdOp::SetScore(idx, val) => {
            buf.add_component(pick(*idx), Score(*val), key_for(position, 0))
        }
        CmdOp::RemoveHp(idx) => buf.remove_component::<Hp>(pick(*idx), key_for(position, 0)),
        CmdOp::Despawn(idx) => buf.destroy_entity(pick(*idx), key_for(position, 0)),
        CmdOp::Spawn(hp) => {
            buf.create_entity_with(ComponentBundle::new().with(Hp(*hp)), key_for(position, 0));
        }
        CmdOp::SpawnThenScore(hp, score) => {
            let pending =
                buf.create_entity_with(ComponentBundle::new().with(Hp(*hp)), key_for(position, 0));
            buf.add_component(pending, Score(*score), key_for(position, 1));
        }
    }
}

/// Create a fresh world with Hp and Score registered, plus 5 initial entities.
fn setup_world_and_entities() -> (World, Vec<Entity>) {
    let mut world = World::new(WorldConfig {
        chunk_capacity: 4,
        ..WorldConfig::default()
    })
    .unwrap();
    world.register_component::<Hp>().unwrap();
    world.register_component::<Score>().unwrap();

    let mut entities = Vec::new();
    for i in 0..5u32 {
        entities.push(world.spawn(ComponentBundle::new().with(Hp(100 + i))).unwrap());
    }
    (world, entities)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    /// Any applied sequence leaves the directory and chunks consistent, and
    /// every command is either applied or counted as failed.
    #[test]
    fn command_sequences_preserve_consistency(ops in prop::collection::vec(cmd_op_strategy(), 1..30)) {
        let (mut world, entities) = setup_world_and_entities();
        let mut buf = CommandBuffer::new(0);
        for (position, op) in ops.iter().enumerate() {
            record(&mut buf, position, op, &entities);
        }
        let queued = buf.len();
        let report = buf.apply(&mut world);

        prop_assert_eq!(report.success_count + report.failed_count, queued);
        prop_assert_eq!(world.validate(), Ok(()));
        for (_, entity) in &report.created {
            prop_assert!(world.get::<Hp>(*entity).is_some() || !world.is_alive(*entity));
        }
    }

    /// Splitting the same commands across two buffers and concatenating
    /// them in either order yields the same world.
    #[test]
    fn concatenation_order_is_irrelevant(
        ops in prop::collection::vec((cmd_op_strategy(), any::<bool>()), 1..40),
    ) {
        fn run(ops: &[(CmdOp, bool)], swap: bool) -> (WorldDigest, usize) {
            let (mut world, entities) = setup_world_and_entities();
            let mut a = CommandBuffer::new(0);
            let mut b = CommandBuffer::new(1);
            for (position, (op, to_b)) in ops.iter().enumerate() {
                let buf = if *to_b { &mut b } else { &mut a };
                record(buf, position, op, &entities);
            }
            let mut merged = if swap {
                CommandBuffer::concat([b, a])
            } else {
                CommandBuffer::concat([a, b])
            };
            let report = merged.apply(&mut world);
            (world.content_digest(), report.failed_count)
        }
        prop_assert_eq!(run(&ops, false), run(&ops, true));
    }

    /// Commands aimed at an entity destroyed earlier in the log fail
    /// without disturbing anything else.
    #[test]
    fn despawn_then_modify_is_graceful(
        target in 0..5usize,
        hp in any::<u32>(),
        score in any::<i64>(),
    ) {
        let (mut world, entities) = setup_world_and_entities();
        let victim = entities[target];
        let mut buf = CommandBuffer::new(0);
        buf.destroy_entity(victim, SortKey::new(1).unwrap());
        buf.add_component(victim, Hp(hp), SortKey::new(2).unwrap());
        buf.add_component(victim, Score(score), SortKey::new(3).unwrap());
        buf.remove_component::<Hp>(victim, SortKey::new(4).unwrap());
        let report = buf.apply(&mut world);

        prop_assert_eq!(report.success_count, 1);
        prop_assert_eq!(report.failed_count, 3);
        prop_assert!(!world.is_alive(victim));
        prop_assert_eq!(world.entity_count(), 4);
        for &e in entities.iter().filter(|&&e| e != victim) {
            prop_assert!(world.get::<Hp>(e).is_some());
        }
    }

    /// Pending entities created in one buffer resolve to live entities.
    #[test]
    fn spawn_commands_create_valid_entities(hps in prop::collection::vec(any::<u32>(), 1..20)) {
        let (mut world, _) = setup_world_and_entities();
        let mut buf = CommandBuffer::new(9);
        let pendings: Vec<PendingEntity> = hps
            .iter()
            .enumerate()
            .map(|(i, hp)| {
                buf.create_entity_with(ComponentBundle::new().with(Hp(*hp)), key_for(i, 0))
            })
            .collect();
        let report = buf.apply(&mut world);

        prop_assert_eq!(report.created.len(), hps.len());
        for (pending, hp) in pendings.iter().zip(&hps) {
            let entity = report.created_entity(*pending).unwrap();
            prop_assert_eq!(world.get::<Hp>(entity), Some(&Hp(*hp)));
        }
        prop_assert_eq!(world.entity_count(), 5 + hps.len());
    }

    /// Applying drains the buffer; a second apply does nothing.
    #[test]
    fn buffer_resets_after_apply(ops in prop::collection::vec(cmd_op_strategy(), 1..10)) {
        let (mut world, entities) = setup_world_and_entities();
        let mut buf = CommandBuffer::new(0);
        for (position, op) in ops.iter().enumerate() {
            record(&mut buf, position, op, &entities);
        }
        buf.apply(&mut world);
        prop_assert!(buf.is_empty());

        let before = world.content_digest();
        let report = buf.apply(&mut world);
        prop_assert_eq!(report.success_count + report.failed_count, 0);
        prop_assert_eq!(world.content_digest(), before);
    }
}
