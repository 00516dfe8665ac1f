//! Engine-level errors.

use tessera_ecs::EcsError;

/// Errors produced by the tick boundary and scenario driver.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `begin_tick` was called while another tick was still open.
    #[error("tick {open} is still open; call end_tick first")]
    TickAlreadyOpen { open: u64 },

    /// `run_processors` or `end_tick` was called with no open tick.
    #[error("no tick is open; call begin_tick first")]
    NoOpenTick,

    /// A tick number went backwards.
    #[error("tick {requested} requested, but the next tick must be at least {expected}")]
    TickOutOfOrder { requested: u64, expected: u64 },

    /// A processor's parallel phase failed; the tick was aborted.
    #[error("processor '{name}' failed on tick {tick}")]
    ProcessorFailed {
        name: String,
        tick: u64,
        #[source]
        source: EcsError,
    },

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other ECS error.
    #[error(transparent)]
    Ecs(#[from] EcsError),
}
