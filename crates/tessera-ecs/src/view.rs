//! Scoped column access for one chunk.
//!
//! A [`ChunkView`] is what a processor receives for each chunk it handles. It
//! borrows the chunk exclusively for the duration of one processing call and
//! hands out typed column slices on request. A small bitmask per view tracks
//! which columns are currently lent out for reading and for writing, so a
//! processor can hold several columns at once (read `Velocity`, write
//! `Position`) while overlapping requests for the same column are refused.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::cell::Cell;

use crate::archetype::{ArchetypeId, Chunk, ChunkId};
use crate::component::{Component, ComponentHandle, ComponentTypeId};
use crate::entity::Entity;
use crate::EcsError;

/// Widest signature a view can track (one bit per column).
pub const MAX_VIEW_COLUMNS: usize = 64;

/// Exclusive, short-lived access to one chunk's columns.
///
/// Slices returned by [`read`](Self::read) and [`write`](Self::write) cannot
/// outlive the view, and the view cannot outlive the processing call that
/// created it.
pub struct ChunkView<'a> {
    chunk: &'a mut Chunk,
    reads: Cell<u64>,
    writes: Cell<u64>,
}

impl<'a> ChunkView<'a> {
    pub(crate) fn new(chunk: &'a mut Chunk) -> Self {
        debug_assert!(chunk.signature().len() <= MAX_VIEW_COLUMNS);
        Self {
            chunk,
            reads: Cell::new(0),
            writes: Cell::new(0),
        }
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Row -> entity mapping for this chunk.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        self.chunk.entities()
    }

    #[inline]
    pub fn archetype_id(&self) -> ArchetypeId {
        self.chunk.archetype_id()
    }

    #[inline]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Whether this chunk's archetype carries `T`.
    #[inline]
    pub fn has<T>(&self, handle: ComponentHandle<T>) -> bool {
        self.chunk.column_index(handle.id()).is_some()
    }

    /// Read-only view of the `T` column.
    ///
    /// Fails with [`EcsError::MissingColumn`] if the archetype has no such
    /// column, or [`EcsError::BorrowConflict`] if it is currently lent out for
    /// writing.
    pub fn read<T: Component>(&self, handle: ComponentHandle<T>) -> Result<&[T], EcsError> {
        let bit = self.column_bit(handle.id())?;
        if self.writes.get() & bit != 0 {
            return Err(self.conflict(handle.id(), "read while written"));
        }
        self.reads.set(self.reads.get() | bit);
        let col = bit.trailing_zeros() as usize;
        self.chunk.column_span::<T>(col)
    }

    /// Mutable view of the `T` column.
    ///
    /// Fails with [`EcsError::BorrowConflict`] if the column is already lent
    /// out, for reading or writing.
    #[allow(clippy::mut_from_ref)]
    pub fn write<T: Component>(&self, handle: ComponentHandle<T>) -> Result<&mut [T], EcsError> {
        let bit = self.column_bit(handle.id())?;
        if (self.reads.get() | self.writes.get()) & bit != 0 {
            return Err(self.conflict(handle.id(), "written while borrowed"));
        }
        let col = bit.trailing_zeros() as usize;
        let column = self.chunk.column(col).ok_or(EcsError::MissingColumn {
            archetype: self.chunk.archetype_id(),
            component: Some(handle.id()),
        })?;
        // SAFETY: the view holds the chunk exclusively, and the bitmask
        // guarantees no other slice of this column is alive for the view's
        // lifetime.
        let slice = unsafe { column.typed_mut_unchecked::<T>(self.chunk.len())? };
        self.writes.set(self.writes.get() | bit);
        Ok(slice)
    }

    /// Read a single row of `T`.
    pub fn get<T: Component>(&self, handle: ComponentHandle<T>, row: usize) -> Option<T> {
        let col = self.chunk.column_index(handle.id())?;
        if self.writes.get() & (1u64 << col) != 0 {
            return None;
        }
        self.chunk.column_span::<T>(col).ok()?.get(row).copied()
    }

    fn column_bit(&self, id: ComponentTypeId) -> Result<u64, EcsError> {
        let col = self.chunk.column_index(id).ok_or(EcsError::MissingColumn {
            archetype: self.chunk.archetype_id(),
            component: Some(id),
        })?;
        Ok(1u64 << col)
    }

    fn conflict(&self, id: ComponentTypeId, detail: &'static str) -> EcsError {
        EcsError::BorrowConflict {
            archetype: self.chunk.archetype_id(),
            chunk: self.chunk.id(),
            component: id,
            detail,
        }
    }
}

impl std::fmt::Debug for ChunkView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkView")
            .field("archetype", &self.chunk.archetype_id())
            .field("chunk", &self.chunk.id())
            .field("len", &self.chunk.len())
            .field("reads", &format_args!("{:#b}", self.reads.get()))
            .field("writes", &format_args!("{:#b}", self.writes.get()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
