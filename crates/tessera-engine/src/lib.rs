//! Tessera Engine -- deterministic tick boundary over the Tessera ECS core.
//!
//! This crate builds on [`tessera_ecs`] to provide the simulation driver: a
//! fixed-timestep tick loop whose processors each run as one parallel phase
//! over matching chunks, followed by a barrier and a sorted replay of the
//! commands every worker recorded.
//!
//! # Quick Start
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! let world = World::new(WorldConfig { seed: 42, ..Default::default() }).unwrap();
//!
//! let config = TickConfig { fixed_dt: 1.0 / 60.0, ..Default::default() };
//! let mut tick_loop = TickLoop::new(world, config).unwrap();
//!
//! tick_loop.add_processor("example", Query::new(), |_ctx| {
//!     // simulation logic here
//!     Ok(())
//! });
//!
//! tick_loop.run_ticks(100).unwrap();
//! assert_eq!(tick_loop.tick_count(), 100);
//! ```

#![deny(unsafe_code)]

pub mod clock;
pub mod error;
pub mod logging;
pub mod scenario;
pub mod tick;

pub use error::EngineError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use tessera_ecs;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use tessera_ecs::prelude::*;

    // Engine-specific exports.
    pub use crate::clock::FixedStepClock;
    pub use crate::error::EngineError;
    pub use crate::logging::init_tracing;
    pub use crate::scenario::{ScenarioConfig, ScenarioOutcome};
    pub use crate::tick::{PhaseDiagnostics, ProcessorFn, TickConfig, TickDiagnostics, TickLoop};
}
