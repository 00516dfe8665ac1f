//! Parallel chunk scheduler.
//!
//! One parallel phase runs a processor over every non-empty chunk matching a
//! query:
//!
//! 1. A flat work list of `(archetype, chunk)` pairs is built on the calling
//!    thread: matching archetypes in creation order, each archetype's chunks
//!    in index order, empty chunks skipped.
//! 2. The list is dealt round-robin across `worker_count` partitions and the
//!    partitions run on a dedicated `rayon` pool. Each partition owns its
//!    chunks exclusively, plus its own [`CommandBuffer`] and local state, so
//!    no locking is needed on component columns.
//! 3. After every partition has finished, the buffers are concatenated in
//!    worker-index order and applied on the calling thread.
//!
//! The scheduler holds `&mut World` for the whole phase. A processor only
//! ever sees a [`ChunkContext`], so calling an immediate structural operation
//! from inside the phase does not compile.

use std::error::Error;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

use crate::archetype::{ArchetypeId, Chunk, ChunkId};
use crate::command::{ApplyReport, CommandBuffer};
use crate::entity::Entity;
use crate::query::Query;
use crate::reduce::DeterministicReduction;
use crate::rng::Pcg32;
use crate::view::ChunkView;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One entry of the work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub archetype: ArchetypeId,
    pub chunk: ChunkId,
    /// Live rows at the time the list was built.
    pub rows: usize,
    slot: usize,
}

/// Build the deterministic work list for `query`.
pub fn build_work_list(world: &World, query: &mut Query) -> Vec<WorkItem> {
    let archetypes = world.archetypes();
    let mut items = Vec::new();
    for &slot in query.matching_archetype_slots(world) {
        let archetype = &archetypes[slot];
        for chunk in archetype.chunks() {
            if chunk.is_empty() {
                continue;
            }
            items.push(WorkItem {
                archetype: archetype.id(),
                chunk: chunk.id(),
                rows: chunk.len(),
                slot,
            });
        }
    }
    items
}

// ---------------------------------------------------------------------------
// ChunkContext
// ---------------------------------------------------------------------------

/// Everything a processor may touch while handling one chunk.
pub struct ChunkContext<'a, L = ()> {
    /// Column access for the chunk being processed.
    pub view: ChunkView<'a>,
    /// This worker's command buffer.
    pub commands: &'a mut CommandBuffer,
    /// Worker-local state supplied by the caller.
    pub local: &'a mut L,
    pub worker_index: usize,
    pub tick: u64,
    pub world_seed: u64,
}

impl<L> ChunkContext<'_, L> {
    /// A fresh generator for `entity` on this tick, independent of which
    /// worker processes it or in what order.
    pub fn rng_for(&self, entity: Entity, salt: u64) -> Pcg32 {
        Pcg32::for_entity(self.world_seed, entity.index(), self.tick, salt)
    }

    /// Convenience: one `u32` from [`rng_for`](Self::rng_for).
    pub fn random_u32(&self, entity: Entity, salt: u64) -> u32 {
        self.rng_for(entity, salt).next_u32()
    }
}

impl<L> std::fmt::Debug for ChunkContext<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkContext")
            .field("view", &self.view)
            .field("worker_index", &self.worker_index)
            .field("tick", &self.tick)
            .field("queued_commands", &self.commands.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ParallelScheduler
// ---------------------------------------------------------------------------

/// Fixed-size worker pool for chunk-parallel phases.
pub struct ParallelScheduler {
    pool: ThreadPool,
    worker_count: usize,
}

impl std::fmt::Debug for ParallelScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelScheduler")
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

impl ParallelScheduler {
    /// Build a pool of exactly `worker_count` threads.
    pub fn new(worker_count: usize) -> Result<Self, EcsError> {
        if worker_count == 0 {
            return Err(EcsError::InvalidWorkerCount {
                requested: worker_count,
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("tessera-worker-{i}"))
            .build()?;
        Ok(Self { pool, worker_count })
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run `processor` over every matching chunk, then apply the recorded
    /// commands.
    pub fn for_each_chunk_parallel<E, F>(
        &self,
        world: &mut World,
        query: &mut Query,
        tick: u64,
        processor: F,
    ) -> Result<ApplyReport, EcsError>
    where
        E: Error + Send + Sync + 'static,
        F: Fn(&mut ChunkContext<'_>) -> Result<(), E> + Sync,
    {
        let mut locals = vec![(); self.worker_count];
        self.for_each_chunk_parallel_with(world, query, tick, &mut locals, processor)
    }

    /// Like [`for_each_chunk_parallel`](Self::for_each_chunk_parallel), with
    /// one caller-owned local per worker (`locals.len()` must equal
    /// [`worker_count`](Self::worker_count)).
    pub fn for_each_chunk_parallel_with<L, E, F>(
        &self,
        world: &mut World,
        query: &mut Query,
        tick: u64,
        locals: &mut [L],
        processor: F,
    ) -> Result<ApplyReport, EcsError>
    where
        L: Send,
        E: Error + Send + Sync + 'static,
        F: Fn(&mut ChunkContext<'_, L>) -> Result<(), E> + Sync,
    {
        if locals.len() != self.worker_count {
            return Err(EcsError::WorkerLocalsMismatch {
                workers: self.worker_count,
                locals: locals.len(),
            });
        }
        let items = build_work_list(world, query);
        let world_seed = world.seed();
        debug!(
            tick,
            chunks = items.len(),
            workers = self.worker_count,
            "parallel phase start"
        );

        let buffers = {
            let partitions = partition(world, &items, self.worker_count);
            self.run_partitions(partitions, locals, tick, world_seed, &processor)?
        };

        // Barrier passed: every partition finished without error.
        let mut merged = CommandBuffer::concat(buffers);
        let queued = merged.len();
        let report = merged.apply(world);
        debug!(
            tick,
            queued,
            applied = report.success_count,
            failed = report.failed_count,
            conflicts = report.conflict_count,
            "parallel phase applied"
        );
        Ok(report)
    }

    /// Run `processor` and collect per-worker contributions into
    /// `reduction`. The processor pushes items onto `ctx.local`, which is its
    /// worker's slot in the reduction.
    pub fn for_each_chunk_reduce<T, E, F>(
        &self,
        world: &mut World,
        query: &mut Query,
        tick: u64,
        reduction: &mut DeterministicReduction<T>,
        processor: F,
    ) -> Result<ApplyReport, EcsError>
    where
        T: Send,
        E: Error + Send + Sync + 'static,
        F: Fn(&mut ChunkContext<'_, Vec<T>>) -> Result<(), E> + Sync,
    {
        self.for_each_chunk_parallel_with(world, query, tick, reduction.slots_mut(), processor)
    }

    fn run_partitions<L, E, F>(
        &self,
        partitions: Vec<Vec<&mut Chunk>>,
        locals: &mut [L],
        tick: u64,
        world_seed: u64,
        processor: &F,
    ) -> Result<Vec<CommandBuffer>, EcsError>
    where
        L: Send,
        E: Error + Send + Sync + 'static,
        F: Fn(&mut ChunkContext<'_, L>) -> Result<(), E> + Sync,
    {
        let outcomes: Vec<Result<CommandBuffer, E>> = self.pool.install(|| {
            partitions
                .into_par_iter()
                .zip(locals.par_iter_mut())
                .enumerate()
                .map(|(worker_index, (chunks, local))| {
                    let mut commands = CommandBuffer::new(worker_index as u32);
                    for chunk in chunks {
                        let mut ctx = ChunkContext {
                            view: ChunkView::new(chunk),
                            commands: &mut commands,
                            local: &mut *local,
                            worker_index,
                            tick,
                            world_seed,
                        };
                        processor(&mut ctx)?;
                    }
                    Ok(commands)
                })
                .collect()
        });

        let mut buffers = Vec::with_capacity(outcomes.len());
        for (worker, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    error!(worker, tick, error = %e, "worker failed; tick aborted, no commands applied");
                    return Err(EcsError::WorkerFailed {
                        worker,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(buffers)
    }
}

/// Deal the chunks named by `items` round-robin across `workers` partitions.
fn partition<'w>(world: &'w mut World, items: &[WorkItem], workers: usize) -> Vec<Vec<&'w mut Chunk>> {
    let mut partitions: Vec<Vec<&mut Chunk>> = (0..workers).map(|_| Vec::new()).collect();
    let mut pending = items.iter().peekable();
    let mut dealt = 0usize;
    // Work-list order is slot order then chunk order, so one forward walk
    // over storage visits the items in sequence.
    for (slot, archetype) in world.archetypes_mut().iter_mut().enumerate() {
        for (index, chunk) in archetype.chunks_mut().iter_mut().enumerate() {
            let wanted = pending
                .peek()
                .is_some_and(|item| item.slot == slot && item.chunk.0 as usize == index);
            if wanted {
                pending.next();
                partitions[dealt % workers].push(chunk);
                dealt += 1;
            }
        }
    }
    debug_assert_eq!(dealt, items.len());
    partitions
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
