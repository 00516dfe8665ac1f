//! Tessera ECS -- deterministic, chunked, data-oriented Entity Component System.
//!
//! Entities are stored in archetypes (one per unique set of component types),
//! and each archetype is split into fixed-capacity chunks with one contiguous
//! column per component. Processors run over chunks in parallel, record
//! structural changes into per-worker command buffers, and those buffers are
//! replayed in a caller-defined sort-key order once every worker is done, so
//! a simulation produces bit-identical results regardless of worker count or
//! thread timing.
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! #[repr(C)]
//! struct Position { x: f32, y: f32 }
//! tessera_ecs::component!(Position);
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! #[repr(C)]
//! struct Velocity { dx: f32, dy: f32 }
//! tessera_ecs::component!(Velocity);
//!
//! let mut world = World::new(WorldConfig::default()).unwrap();
//! let pos = world.register_component::<Position>().unwrap();
//! let vel = world.register_component::<Velocity>().unwrap();
//!
//! let entity = world
//!     .spawn(ComponentBundle::new()
//!         .with(Position { x: 0.0, y: 0.0 })
//!         .with(Velocity { dx: 1.0, dy: 0.0 }))
//!     .unwrap();
//!
//! let scheduler = ParallelScheduler::new(2).unwrap();
//! let mut query = Query::new().all(pos).all(vel);
//! scheduler
//!     .for_each_chunk_parallel(&mut world, &mut query, 1, |ctx| {
//!         let v = ctx.view.read(vel)?;
//!         for (p, v) in ctx.view.write(pos)?.iter_mut().zip(v) {
//!             p.x += v.dx;
//!         }
//!         Ok::<_, EcsError>(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(world.get::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod query;
pub mod reduce;
pub mod rng;
pub mod scheduler;
pub mod snapshot;
#[allow(unsafe_code)]
pub mod view;
pub mod world;

use archetype::{ArchetypeId, ChunkId};
use command::PendingEntity;
use component::ComponentTypeId;
use entity::Entity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale version or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: Entity },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// Two different component types folded to the same id under the strict
    /// collision policy.
    #[error("component type id {id} collides: '{existing}' is already registered, '{incoming}' folds to the same id")]
    TypeIdCollision {
        id: ComponentTypeId,
        existing: String,
        incoming: String,
    },

    /// Typed access asked for a different Rust type than the column holds.
    #[error("column '{component}' does not hold values of type {requested}")]
    TypeMismatch {
        component: String,
        requested: &'static str,
    },

    /// The archetype has no column for the requested component.
    #[error("archetype {archetype} has no column for {component:?}")]
    MissingColumn {
        archetype: ArchetypeId,
        component: Option<ComponentTypeId>,
    },

    /// A location pointed at a chunk that does not exist.
    #[error("archetype {archetype} has no chunk {}", .chunk.0)]
    MissingChunk { archetype: ArchetypeId, chunk: ChunkId },

    /// Overlapping column access inside one chunk view.
    #[error("column {component} of chunk {} in {archetype}: {detail}", .chunk.0)]
    BorrowConflict {
        archetype: ArchetypeId,
        chunk: ChunkId,
        component: ComponentTypeId,
        detail: &'static str,
    },

    /// An archetype signature exceeds the column tracker width.
    #[error("archetype signature has {count} component types, at most {max} are supported")]
    SignatureTooWide { count: usize, max: usize },

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A manifest byte string had the wrong length.
    #[error("component manifest must be {} bytes, got {len}", component::ComponentManifest::ENCODED_LEN)]
    ManifestDecode { len: usize },

    /// A command targeted a pending entity that had not been created yet at
    /// its position in the applied log.
    #[error("pending entity {pending:?} was not created before it was targeted")]
    UnresolvedPendingEntity { pending: PendingEntity },

    /// A scheduler was asked for zero workers.
    #[error("worker count must be at least 1, got {requested}")]
    InvalidWorkerCount { requested: usize },

    /// Per-worker locals did not line up with the pool size.
    #[error("scheduler has {workers} workers but {locals} locals were supplied")]
    WorkerLocalsMismatch { workers: usize, locals: usize },

    /// The worker thread pool could not be built.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A processor returned an error; the phase was aborted before any
    /// command was applied.
    #[error("worker {worker} failed")]
    WorkerFailed {
        worker: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, Chunk, ChunkId};
    pub use crate::command::{
        ApplyReport, Command, CommandBuffer, CommandKind, EntityRef, PendingEntity, SortKey,
    };
    pub use crate::component::{
        CollisionPolicy, Component, ComponentHandle, ComponentInfo, ComponentManifest,
        ComponentRegistry, ComponentTypeId,
    };
    pub use crate::entity::{Entity, EntityLocation};
    pub use crate::query::{Query, QueryDesc};
    pub use crate::reduce::DeterministicReduction;
    pub use crate::rng::Pcg32;
    pub use crate::scheduler::{build_work_list, ChunkContext, ParallelScheduler, WorkItem};
    pub use crate::snapshot::{
        ArchetypeUtilization, EntityDebugRecord, InvariantViolation, WorldDigest, WorldStats,
    };
    pub use crate::view::ChunkView;
    pub use crate::world::{ComponentBundle, World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
