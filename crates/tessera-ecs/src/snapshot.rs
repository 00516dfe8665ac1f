//! Read-only inspection of world state.
//!
//! Everything here is non-authoritative: statistics, per-archetype
//! utilization, a per-entity debug record, an invariant validator that
//! cross-checks the entity directory against chunk contents, and an
//! order-independent content digest used for determinism checks. All types
//! are serializable so they can be dumped as JSON.

use serde::{Deserialize, Serialize};

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;
use crate::entity::{Entity, EntityLocation};
use crate::query::Query;
use crate::world::World;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Aggregate counters for a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldStats {
    pub entity_count: usize,
    /// Directory slots ever allocated (live, free, and retired).
    pub entity_slots: usize,
    pub free_slots: usize,
    pub retired_slots: usize,
    pub component_types: usize,
    pub archetype_count: usize,
    pub non_empty_archetypes: usize,
    pub chunk_count: usize,
    pub non_empty_chunks: usize,
    /// Total rows across all allocated chunks.
    pub row_capacity: usize,
    pub archetype_version: u64,
}

/// How full one archetype's chunks are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeUtilization {
    pub archetype: ArchetypeId,
    /// Qualified component names, in signature order.
    pub components: Vec<String>,
    pub entity_count: usize,
    pub chunk_count: usize,
    pub empty_chunks: usize,
    pub row_capacity: usize,
    /// `entity_count / row_capacity`, or 0 for an archetype with no chunks.
    pub fill_ratio: f64,
}

/// One component of an [`EntityDebugRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDebug {
    pub id: ComponentTypeId,
    pub name: String,
    /// Raw little-endian bytes, hex encoded.
    pub bytes_hex: String,
}

/// Where an entity lives and what it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDebugRecord {
    pub entity: Entity,
    pub location: EntityLocation,
    pub components: Vec<ComponentDebug>,
}

/// First inconsistency found by [`World::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invariant violated: {message}")]
pub struct InvariantViolation {
    pub message: String,
}

impl InvariantViolation {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Order-independent hash of (entity index, version, component bytes).
///
/// Two worlds holding the same entities with the same component values
/// produce the same digest regardless of archetype creation order, chunk
/// placement, or row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldDigest {
    pub entities: u64,
    pub bytes: [u8; 32],
}

impl WorldDigest {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.bytes).to_hex().to_string()
    }
}

impl std::fmt::Display for WorldDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} entities)", self.to_hex(), self.entities)
    }
}

/// Running xor and lane-wise wrapping sum of per-entity hashes.
#[derive(Default)]
struct DigestAccumulator {
    count: u64,
    xor: [u8; 32],
    sum: [u64; 4],
}

impl DigestAccumulator {
    fn absorb(&mut self, hash: &blake3::Hash) {
        let bytes = hash.as_bytes();
        for (acc, b) in self.xor.iter_mut().zip(bytes) {
            *acc ^= b;
        }
        for (lane, chunk) in self.sum.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *lane = lane.wrapping_add(u64::from_le_bytes(word));
        }
        self.count += 1;
    }

    fn seal(self) -> WorldDigest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.count.to_le_bytes());
        hasher.update(&self.xor);
        for lane in self.sum {
            hasher.update(&lane.to_le_bytes());
        }
        WorldDigest {
            entities: self.count,
            bytes: *hasher.finalize().as_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// World inspection impl
// ---------------------------------------------------------------------------

impl World {
    /// Aggregate counters.
    pub fn stats(&self) -> WorldStats {
        let archetypes = self.archetypes();
        let chunks = archetypes.iter().flat_map(|a| a.chunks());
        WorldStats {
            entity_count: self.entity_count(),
            entity_slots: self.directory().capacity(),
            free_slots: self.directory().free_count(),
            retired_slots: self.directory().retired_count(),
            component_types: self.registry().len(),
            archetype_count: archetypes.len(),
            non_empty_archetypes: archetypes.iter().filter(|a| !a.is_empty()).count(),
            chunk_count: chunks.clone().count(),
            non_empty_chunks: chunks.clone().filter(|c| !c.is_empty()).count(),
            row_capacity: chunks.map(|c| c.capacity()).sum(),
            archetype_version: self.archetype_version(),
        }
    }

    /// Per-archetype fill, in creation order.
    pub fn archetype_utilization(&self) -> Vec<ArchetypeUtilization> {
        self.archetypes()
            .iter()
            .map(|archetype| {
                let row_capacity: usize = archetype.chunks().iter().map(|c| c.capacity()).sum();
                let fill_ratio = if row_capacity == 0 {
                    0.0
                } else {
                    archetype.len() as f64 / row_capacity as f64
                };
                ArchetypeUtilization {
                    archetype: archetype.id(),
                    components: archetype.layouts().iter().map(|i| i.qualified_name()).collect(),
                    entity_count: archetype.len(),
                    chunk_count: archetype.chunks().len(),
                    empty_chunks: archetype.chunks().iter().filter(|c| c.is_empty()).count(),
                    row_capacity,
                    fill_ratio,
                }
            })
            .collect()
    }

    /// Location and raw component bytes of a live entity.
    pub fn debug_entity(&self, entity: Entity) -> Option<EntityDebugRecord> {
        let location = self.location(entity)?;
        let archetype = self.archetype(location.archetype)?;
        let components = archetype
            .layouts()
            .iter()
            .map(|info| {
                let bytes = self.component_bytes(entity, info.id).unwrap_or_default();
                ComponentDebug {
                    id: info.id,
                    name: info.qualified_name(),
                    bytes_hex: bytes.iter().map(|b| format!("{b:02x}")).collect(),
                }
            })
            .collect();
        Some(EntityDebugRecord {
            entity,
            location,
            components,
        })
    }

    /// Walk the directory and every chunk, cross-checking them. Returns the
    /// first inconsistency found.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let directory = self.directory();

        // Directory -> storage.
        let mut live = 0usize;
        for (index, version, alive, location) in directory.iter_slots() {
            let entity = Entity::new(index, version);
            match (alive, location) {
                (true, None) => {
                    return Err(InvariantViolation::new(format!(
                        "live entity {entity:?} has no location"
                    )))
                }
                (false, Some(loc)) => {
                    return Err(InvariantViolation::new(format!(
                        "dead slot {index} still points at {loc:?}"
                    )))
                }
                (true, Some(loc)) => {
                    live += 1;
                    let chunk = self.chunk_at(loc.archetype, loc.chunk).ok_or_else(|| {
                        InvariantViolation::new(format!(
                            "{entity:?} points at missing chunk {} of archetype {}",
                            loc.chunk.0, loc.archetype
                        ))
                    })?;
                    if chunk.entities().get(loc.row as usize) != Some(&entity) {
                        return Err(InvariantViolation::new(format!(
                            "{entity:?} expected at row {} of chunk {} in {}, found {:?}",
                            loc.row,
                            loc.chunk.0,
                            loc.archetype,
                            chunk.entities().get(loc.row as usize)
                        )));
                    }
                }
                (false, None) => {}
            }
        }
        if live != directory.alive_count() {
            return Err(InvariantViolation::new(format!(
                "directory counts {} live entities but {live} slots are alive",
                directory.alive_count()
            )));
        }

        // Storage -> directory.
        let mut stored = 0usize;
        for archetype in self.archetypes() {
            let signature = archetype.signature();
            if signature.windows(2).any(|w| w[0] >= w[1]) {
                return Err(InvariantViolation::new(format!(
                    "archetype {} signature is not strictly ascending",
                    archetype.id()
                )));
            }
            if let Some(id) = signature.iter().find(|id| !self.registry().contains(**id)) {
                return Err(InvariantViolation::new(format!(
                    "archetype {} references unregistered component {id}",
                    archetype.id()
                )));
            }
            if archetype.len() != archetype.counted_rows() {
                return Err(InvariantViolation::new(format!(
                    "archetype {} counts {} rows but its chunks hold {}",
                    archetype.id(),
                    archetype.len(),
                    archetype.counted_rows()
                )));
            }
            for chunk in archetype.chunks() {
                if chunk.len() > chunk.capacity() {
                    return Err(InvariantViolation::new(format!(
                        "chunk {} of {} holds {} rows over capacity {}",
                        chunk.id().0,
                        archetype.id(),
                        chunk.len(),
                        chunk.capacity()
                    )));
                }
                for (row, &entity) in chunk.entities().iter().enumerate() {
                    let expected = EntityLocation {
                        archetype: archetype.id(),
                        chunk: chunk.id(),
                        row: row as u32,
                    };
                    if directory.location(entity) != Some(expected) {
                        return Err(InvariantViolation::new(format!(
                            "row {row} of chunk {} in {} holds {entity:?}, directory says {:?}",
                            chunk.id().0,
                            archetype.id(),
                            directory.location(entity)
                        )));
                    }
                }
            }
            stored += archetype.len();
        }
        if stored != directory.alive_count() {
            return Err(InvariantViolation::new(format!(
                "chunks hold {stored} rows but {} entities are alive",
                directory.alive_count()
            )));
        }
        Ok(())
    }

    /// Digest over every live entity.
    pub fn content_digest(&self) -> WorldDigest {
        let mut acc = DigestAccumulator::default();
        for slot in 0..self.archetypes().len() {
            self.digest_archetype(slot, &mut acc);
        }
        acc.seal()
    }

    /// Digest over the entities matching `query`.
    pub fn content_digest_for(&self, query: &mut Query) -> WorldDigest {
        let mut acc = DigestAccumulator::default();
        for &slot in query.matching_archetype_slots(self) {
            self.digest_archetype(slot, &mut acc);
        }
        acc.seal()
    }

    fn digest_archetype(&self, slot: usize, acc: &mut DigestAccumulator) {
        let archetype = &self.archetypes()[slot];
        for chunk in archetype.chunks() {
            for (row, entity) in chunk.entities().iter().enumerate() {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&entity.index().to_le_bytes());
                hasher.update(&entity.version().to_le_bytes());
                for column in chunk.columns() {
                    hasher.update(&column.component().value().to_le_bytes());
                    hasher.update(column.row_bytes(row));
                }
                acc.absorb(&hasher.finalize());
            }
        }
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
