//! Fixed-timestep tick loop for deterministic simulation.
//!
//! The [`TickLoop`] drives the simulation forward. Each tick:
//!
//! 1. [`begin_tick`](TickLoop::begin_tick) opens tick `n`.
//! 2. [`run_processors`](TickLoop::run_processors) runs every registered
//!    processor in registration order. Each processor is one parallel phase:
//!    its chunks are spread over the worker pool, then the per-worker command
//!    buffers are merged and applied in sort-key order before the next
//!    processor starts.
//! 3. [`end_tick`](TickLoop::end_tick) closes the tick and records
//!    diagnostics.
//!
//! Because processor order is fixed, commands replay by sort key, and
//! randomness is derived from `(world seed, entity, tick)`, the loop is fully
//! deterministic: same initial state + same processors + same tick numbers =
//! same final state, for any worker count.
//!
//! # Example
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! #[repr(C)]
//! struct Counter(u32);
//! tessera_ecs::component!(Counter);
//!
//! let mut world = World::new(WorldConfig::default()).unwrap();
//! let counter = world.register_component::<Counter>().unwrap();
//! world.spawn(ComponentBundle::new().with(Counter(0))).unwrap();
//!
//! let config = TickConfig { worker_count: 2, ..Default::default() };
//! let mut tick_loop = TickLoop::new(world, config).unwrap();
//! tick_loop.add_processor("count", Query::new().all(counter), move |ctx| {
//!     for c in ctx.view.write(counter)? {
//!         c.0 += 1;
//!     }
//!     Ok(())
//! });
//!
//! tick_loop.run_ticks(10).unwrap();
//! assert_eq!(tick_loop.tick_count(), 10);
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tessera_ecs::command::ApplyReport;
use tessera_ecs::query::Query;
use tessera_ecs::scheduler::{ChunkContext, ParallelScheduler};
use tessera_ecs::world::World;
use tessera_ecs::EcsError;
use tracing::{debug_span, error, info_span};

use crate::clock::FixedStepClock;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep tick loop.
///
/// The `fixed_dt` is the duration in seconds of each simulation tick. A value
/// of `1.0 / 60.0` gives 60 ticks per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Threads in the processor worker pool.
    pub worker_count: usize,
    /// Catch-up limit for [`FixedStepClock`].
    pub max_steps_per_update: u32,
}

impl Default for TickConfig {
    /// Defaults to 60 Hz, 4 workers, at most 8 catch-up steps.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            worker_count: 4,
            max_steps_per_update: 8,
        }
    }
}

impl TickConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    fn validate(&self) -> Result<(), EngineError> {
        if !(self.fixed_dt > 0.0 && self.fixed_dt.is_finite()) {
            return Err(EngineError::InvalidConfig(format!(
                "fixed_dt must be positive and finite, got {}",
                self.fixed_dt
            )));
        }
        if self.max_steps_per_update == 0 {
            return Err(EngineError::InvalidConfig(
                "max_steps_per_update must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// A clock stepping at this config's rate.
    pub fn clock(&self) -> FixedStepClock {
        FixedStepClock::new(self.fixed_dt, self.max_steps_per_update)
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and apply results for one processor phase.
#[derive(Debug, Clone)]
pub struct PhaseDiagnostics {
    pub processor: String,
    /// Parallel phase plus command apply.
    pub time: Duration,
    pub report: ApplyReport,
}

/// Diagnostics for the last completed tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    pub tick: u64,
    /// One entry per processor, in execution order.
    pub phases: Vec<PhaseDiagnostics>,
    /// Wall-clock time from `begin_tick` to `end_tick`.
    pub total_time: Duration,
}

impl TickDiagnostics {
    /// Sum of commands that failed to apply this tick.
    pub fn failed_commands(&self) -> usize {
        self.phases.iter().map(|p| p.report.failed_count).sum()
    }

    /// Sum of last-write-wins conflicts this tick.
    pub fn conflicts(&self) -> usize {
        self.phases.iter().map(|p| p.report.conflict_count).sum()
    }
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// A processor invoked once per matching chunk.
pub type ProcessorFn = Box<dyn Fn(&mut ChunkContext<'_>) -> Result<(), EcsError> + Send + Sync>;

struct RegisteredProcessor {
    name: String,
    query: Query,
    func: ProcessorFn,
}

impl std::fmt::Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProcessor")
            .field("name", &self.name)
            .field("query", self.query.desc())
            .finish()
    }
}

struct OpenTick {
    tick: u64,
    started: Instant,
    phases: Vec<PhaseDiagnostics>,
    processors_run: bool,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The deterministic fixed-timestep tick loop.
pub struct TickLoop {
    world: World,
    scheduler: ParallelScheduler,
    processors: Vec<RegisteredProcessor>,
    config: TickConfig,
    /// Lowest tick number `begin_tick` will accept.
    next_tick: u64,
    /// Number of ticks completed so far.
    ticks_completed: u64,
    open: Option<OpenTick>,
    last_diagnostics: TickDiagnostics,
}

impl std::fmt::Debug for TickLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickLoop")
            .field("world", &self.world)
            .field("processors", &self.processors)
            .field("config", &self.config)
            .field("next_tick", &self.next_tick)
            .field("open_tick", &self.open.as_ref().map(|o| o.tick))
            .finish()
    }
}

impl TickLoop {
    /// Create a tick loop that owns `world` and a pool of
    /// `config.worker_count` workers. The first tick is numbered 0.
    pub fn new(world: World, config: TickConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let scheduler = ParallelScheduler::new(config.worker_count)?;
        Ok(Self {
            world,
            scheduler,
            processors: Vec::new(),
            config,
            next_tick: 0,
            ticks_completed: 0,
            open: None,
            last_diagnostics: TickDiagnostics::default(),
        })
    }

    /// Register a processor to run each tick over the chunks matching
    /// `query`. Processors run in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a processor with the same name is already registered.
    pub fn add_processor<F>(&mut self, name: &str, query: Query, func: F)
    where
        F: Fn(&mut ChunkContext<'_>) -> Result<(), EcsError> + Send + Sync + 'static,
    {
        assert!(
            !self.processors.iter().any(|p| p.name == name),
            "duplicate processor name: {name:?}"
        );
        self.processors.push(RegisteredProcessor {
            name: name.to_owned(),
            query,
            func: Box::new(func),
        });
    }

    /// Open tick `tick`. Tick numbers must not go backwards; gaps are
    /// allowed (a clock may skip steps).
    pub fn begin_tick(&mut self, tick: u64) -> Result<(), EngineError> {
        if let Some(open) = &self.open {
            return Err(EngineError::TickAlreadyOpen { open: open.tick });
        }
        if tick < self.next_tick {
            return Err(EngineError::TickOutOfOrder {
                requested: tick,
                expected: self.next_tick,
            });
        }
        self.open = Some(OpenTick {
            tick,
            started: Instant::now(),
            phases: Vec::with_capacity(self.processors.len()),
            processors_run: false,
        });
        Ok(())
    }

    /// Run every processor for the open tick.
    ///
    /// If a processor fails, its phase applies nothing, the remaining
    /// processors are skipped, and the tick is closed without advancing:
    /// the same tick number may be opened again.
    pub fn run_processors(&mut self) -> Result<(), EngineError> {
        let Some(open) = self.open.as_mut() else {
            return Err(EngineError::NoOpenTick);
        };
        let tick = open.tick;
        let _tick_span = info_span!("tick", tick).entered();

        for processor in &mut self.processors {
            let _phase_span = debug_span!("processor", name = %processor.name).entered();
            let started = Instant::now();
            let func = &processor.func;
            let result = self.scheduler.for_each_chunk_parallel(
                &mut self.world,
                &mut processor.query,
                tick,
                |ctx| func(ctx),
            );
            match result {
                Ok(report) => open.phases.push(PhaseDiagnostics {
                    processor: processor.name.clone(),
                    time: started.elapsed(),
                    report,
                }),
                Err(source) => {
                    error!(tick, processor = %processor.name, error = %source, "processor failed; tick aborted");
                    self.open = None;
                    return Err(EngineError::ProcessorFailed {
                        name: processor.name.clone(),
                        tick,
                        source,
                    });
                }
            }
        }
        open.processors_run = true;
        Ok(())
    }

    /// Close the open tick. Returns the tick number just completed.
    pub fn end_tick(&mut self) -> Result<u64, EngineError> {
        let open = self.open.take().ok_or(EngineError::NoOpenTick)?;
        if !open.processors_run {
            tracing::debug!(tick = open.tick, "tick closed without running processors");
        }
        self.next_tick = open.tick + 1;
        self.ticks_completed += 1;
        self.last_diagnostics = TickDiagnostics {
            tick: open.tick,
            phases: open.phases,
            total_time: open.started.elapsed(),
        };
        Ok(open.tick)
    }

    /// Execute one full tick numbered [`next_tick`](Self::next_tick).
    pub fn tick(&mut self) -> Result<u64, EngineError> {
        self.begin_tick(self.next_tick)?;
        self.run_processors()?;
        self.end_tick()
    }

    /// Run `count` ticks in sequence, stopping at the first failure.
    pub fn run_ticks(&mut self, count: u64) -> Result<(), EngineError> {
        for _ in 0..count {
            self.tick()?;
        }
        Ok(())
    }

    /// Feed `elapsed` wall-clock time into `clock` and run the steps it pays
    /// out. Returns the number of ticks run.
    pub fn advance(&mut self, clock: &mut FixedStepClock, elapsed: Duration) -> Result<u32, EngineError> {
        let steps = clock.accumulate(elapsed);
        for _ in 0..steps {
            self.tick()?;
        }
        Ok(steps)
    }

    // -- accessors ----------------------------------------------------------

    /// The number of ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.ticks_completed
    }

    /// The lowest tick number `begin_tick` will accept next.
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    /// The open tick, if any.
    pub fn open_tick(&self) -> Option<u64> {
        self.open.as_ref().map(|o| o.tick)
    }

    /// Simulation time at the start of the next tick, in seconds.
    ///
    /// Computed as `next_tick * fixed_dt` to avoid floating-point drift from
    /// repeated addition.
    pub fn sim_time(&self) -> f64 {
        self.next_tick as f64 * self.config.fixed_dt
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    /// Read-only access to the ECS world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the ECS world, for setup and tests between ticks.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Give the world back, dropping the worker pool.
    pub fn into_world(self) -> World {
        self.world
    }

    /// The number of registered processors.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// The names of all registered processors, in execution order.
    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name.as_str()).collect()
    }

    /// Diagnostics from the last completed tick.
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ecs::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f64,
        y: f64,
    }
    tessera_ecs::component!(Position);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Velocity {
        dx: f64,
        dy: f64,
    }
    tessera_ecs::component!(Velocity);

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Health(u32);
    tessera_ecs::component!(Health);

    fn setup_world() -> World {
        let mut world = World::new(WorldConfig {
            seed: 11,
            chunk_capacity: 16,
            ..WorldConfig::default()
        })
        .unwrap();
        world.register_component::<Position>().unwrap();
        world.register_component::<Velocity>().unwrap();
        world.register_component::<Health>().unwrap();
        for i in 0..50 {
            world
                .spawn(
                    ComponentBundle::new()
                        .with(Position { x: i as f64, y: 0.0 })
                        .with(Velocity { dx: 1.0, dy: 2.0 })
                        .with(Health(3)),
                )
                .unwrap();
        }
        world
    }

    fn movement_loop(workers: usize) -> TickLoop {
        let world = setup_world();
        let pos = world.component_handle::<Position>().unwrap();
        let vel = world.component_handle::<Velocity>().unwrap();
        let config = TickConfig {
            worker_count: workers,
            ..TickConfig::default()
        };
        let mut tick_loop = TickLoop::new(world, config).unwrap();
        tick_loop.add_processor("movement", Query::new().all(pos).all(vel), move |ctx| {
            let v = ctx.view.read(vel)?;
            for (p, v) in ctx.view.write(pos)?.iter_mut().zip(v) {
                p.x += v.dx;
                p.y += v.dy;
            }
            Ok(())
        });
        tick_loop
    }

    #[test]
    fn run_ticks_advances_counters() {
        let mut tick_loop = movement_loop(2);
        tick_loop.run_ticks(5).unwrap();
        assert_eq!(tick_loop.tick_count(), 5);
        assert_eq!(tick_loop.next_tick(), 5);
        assert!((tick_loop.sim_time() - 5.0 / 60.0).abs() < 1e-12);
        let e = Entity::new(0, 1);
        assert_eq!(
            tick_loop.world().get::<Position>(e),
            Some(&Position { x: 5.0, y: 10.0 })
        );
        assert_eq!(tick_loop.last_diagnostics().tick, 4);
        assert_eq!(tick_loop.last_diagnostics().phases.len(), 1);
    }

    #[test]
    fn tick_boundary_misuse_is_rejected() {
        let mut tick_loop = movement_loop(1);
        assert!(matches!(tick_loop.run_processors(), Err(EngineError::NoOpenTick)));
        assert!(matches!(tick_loop.end_tick(), Err(EngineError::NoOpenTick)));

        tick_loop.begin_tick(3).unwrap();
        assert!(matches!(
            tick_loop.begin_tick(4),
            Err(EngineError::TickAlreadyOpen { open: 3 })
        ));
        tick_loop.run_processors().unwrap();
        assert_eq!(tick_loop.end_tick().unwrap(), 3);

        assert!(matches!(
            tick_loop.begin_tick(2),
            Err(EngineError::TickOutOfOrder { requested: 2, expected: 4 })
        ));
        tick_loop.begin_tick(10).unwrap();
        assert_eq!(tick_loop.open_tick(), Some(10));
    }

    #[test]
    fn processors_run_in_registration_order_with_apply_between() {
        let world = setup_world();
        let health = world.component_handle::<Health>().unwrap();
        let mut tick_loop = TickLoop::new(world, TickConfig::default()).unwrap();

        // First phase destroys entities at Health 1; second phase decrements.
        // Destroys queued by the first phase are applied before the second
        // runs, so the second never sees those entities.
        tick_loop.add_processor("reap", Query::new().all(health), move |ctx| {
            let h = ctx.view.read(health)?;
            for (&e, h) in ctx.view.entities().iter().zip(h) {
                if h.0 <= 1 {
                    ctx.commands.destroy_entity(e, SortKey::for_entity(ctx.tick, e.index(), 0));
                }
            }
            Ok(())
        });
        tick_loop.add_processor("decay", Query::new().all(health), move |ctx| {
            for h in ctx.view.write(health)? {
                h.0 -= 1;
            }
            Ok(())
        });
        assert_eq!(tick_loop.processor_names(), vec!["reap", "decay"]);

        tick_loop.run_ticks(2).unwrap();
        assert_eq!(tick_loop.world().entity_count(), 50);
        tick_loop.tick().unwrap();
        assert_eq!(tick_loop.world().entity_count(), 0);
        let diag = tick_loop.last_diagnostics();
        assert_eq!(diag.phases[0].report.success_count, 50);
        assert_eq!(diag.failed_commands(), 0);
    }

    #[test]
    fn failed_processor_aborts_tick() {
        let world = setup_world();
        let pos = world.component_handle::<Position>().unwrap();
        let mut tick_loop = TickLoop::new(world, TickConfig::default()).unwrap();
        tick_loop.add_processor("spawner", Query::new().all(pos), move |ctx| {
            let key = SortKey::for_entity(ctx.tick, ctx.view.entities()[0].index(), 0);
            ctx.commands.create_entity(key);
            Ok(())
        });
        tick_loop.add_processor("broken", Query::new().all(pos), move |ctx| {
            let _w = ctx.view.write(pos)?;
            // Overlapping borrow of the same column.
            ctx.view.read(pos)?;
            Ok(())
        });

        let err = tick_loop.tick().unwrap_err();
        match err {
            EngineError::ProcessorFailed { name, tick, .. } => {
                assert_eq!(name, "broken");
                assert_eq!(tick, 0);
            }
            other => panic!("expected ProcessorFailed, got {other:?}"),
        }
        assert_eq!(tick_loop.open_tick(), None);
        assert_eq!(tick_loop.tick_count(), 0);
        assert_eq!(tick_loop.next_tick(), 0);
    }

    #[test]
    fn advance_runs_clock_steps() {
        let mut tick_loop = movement_loop(2);
        let mut clock = tick_loop.config().clock();
        let ran = tick_loop
            .advance(&mut clock, Duration::from_secs_f64(2.5 / 60.0))
            .unwrap();
        assert_eq!(ran, 2);
        assert_eq!(tick_loop.tick_count(), 2);
    }

    #[test]
    #[should_panic(expected = "duplicate processor name")]
    fn duplicate_processor_name_panics() {
        let mut tick_loop = movement_loop(1);
        tick_loop.add_processor("movement", Query::new(), |_ctx| Ok(()));
    }

    #[test]
    fn config_validation_and_json() {
        let bad = TickConfig {
            fixed_dt: 0.0,
            ..TickConfig::default()
        };
        assert!(matches!(
            TickLoop::new(setup_world(), bad),
            Err(EngineError::InvalidConfig(_))
        ));
        let zero_workers = TickConfig {
            worker_count: 0,
            ..TickConfig::default()
        };
        assert!(matches!(
            TickLoop::new(setup_world(), zero_workers),
            Err(EngineError::Ecs(EcsError::InvalidWorkerCount { requested: 0 }))
        ));

        let cfg = TickConfig::from_json(r#"{ "worker_count": 8 }"#).unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.max_steps_per_update, 8);
        assert!(TickConfig::from_json("not json").is_err());
    }
}
