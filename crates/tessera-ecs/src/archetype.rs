//! Archetype and chunk storage.
//!
//! An [`Archetype`] owns every entity that carries exactly one set of
//! component types (its *signature*). Rows live in fixed-capacity [`Chunk`]s:
//! each chunk holds one [`Column`] per signature entry plus a row -> entity
//! column. Chunks never grow; a full archetype appends a new chunk, so column
//! memory handed out for a chunk stays put for as long as the chunk exists.
//!
//! Rows are kept dense with swap-remove. Any row index other than the one in
//! the [`EntityDirectory`](crate::entity::EntityDirectory) is invalidated by a
//! removal elsewhere in the same chunk.
//!
//! # Safety
//!
//! [`Column`] stores component data in a raw, zero-initialized, correctly
//! aligned allocation. Components are `bytemuck::Pod`, so every byte pattern
//! in a column is a valid value and rows can be moved by plain byte copy.
//! Typed access checks the column's `TypeId` before reinterpreting bytes.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::any::TypeId;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::Entity;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId / ChunkId
// ---------------------------------------------------------------------------

/// Identifies an archetype: a hash of its signature plus a disambiguator
/// counting earlier archetypes whose signatures hashed to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId {
    value: u32,
    disambiguator: u32,
}

impl ArchetypeId {
    pub fn new(value: u32, disambiguator: u32) -> Self {
        Self {
            value,
            disambiguator,
        }
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.value
    }

    #[inline]
    pub fn disambiguator(self) -> u32 {
        self.disambiguator
    }
}

impl std::fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}.{}", self.value, self.disambiguator)
    }
}

/// Index of a chunk within its archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

/// 32-bit FNV-1a over the little-endian bytes of a sorted signature.
pub fn signature_hash(signature: &[ComponentTypeId]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for id in signature {
        for byte in id.value().to_le_bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    hash
}

// ---------------------------------------------------------------------------
// Column -- type-erased, fixed-capacity component storage
// ---------------------------------------------------------------------------

/// A fixed-capacity, densely packed array of one component type.
///
/// The allocation is zeroed at creation, so all `capacity` slots are
/// initialized bytes at all times.
pub struct Column {
    data: NonNull<u8>,
    capacity: usize,
    info: ComponentInfo,
}

// Column only stores `Pod` bytes, which are Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Allocate a zeroed column with room for `capacity` rows.
    pub fn new(info: &ComponentInfo, capacity: usize) -> Self {
        let data = match Self::layout(info.size, info.align, capacity) {
            Some(layout) => {
                // SAFETY: layout has non-zero size.
                let raw = unsafe { alloc::alloc_zeroed(layout) };
                match NonNull::new(raw) {
                    Some(ptr) => ptr,
                    None => alloc::handle_alloc_error(layout),
                }
            }
            // ZST or empty: a dangling but aligned pointer is valid for
            // zero-sized reads.
            None => NonNull::new(info.align as *mut u8).unwrap_or(NonNull::dangling()),
        };
        Self {
            data,
            capacity,
            info: info.clone(),
        }
    }

    fn layout(size: usize, align: usize, capacity: usize) -> Option<Layout> {
        if size == 0 || capacity == 0 {
            return None;
        }
        let bytes = size.checked_mul(capacity).expect("column size overflow");
        Layout::from_size_align(bytes, align).ok()
    }

    /// Metadata of the stored component type.
    #[inline]
    pub fn info(&self) -> &ComponentInfo {
        &self.info
    }

    /// Component type id of this column.
    #[inline]
    pub fn component(&self) -> ComponentTypeId {
        self.info.id
    }

    #[inline]
    fn item_size(&self) -> usize {
        self.info.size
    }

    /// Bytes of the first `len` rows.
    pub fn bytes(&self, len: usize) -> &[u8] {
        assert!(len <= self.capacity);
        // SAFETY: the allocation holds `capacity * size` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), len * self.item_size()) }
    }

    /// Bytes of one row.
    pub fn row_bytes(&self, row: usize) -> &[u8] {
        let size = self.item_size();
        &self.bytes(row + 1)[row * size..]
    }

    /// Overwrite one row with `value` (exactly one element's bytes).
    pub fn write_row(&mut self, row: usize, value: &[u8]) {
        assert!(row < self.capacity, "row {row} out of column capacity");
        assert_eq!(value.len(), self.item_size(), "component byte size mismatch");
        // SAFETY: row is in bounds and `value` cannot overlap our allocation
        // through a `&mut self` borrow.
        unsafe {
            ptr::copy_nonoverlapping(
                value.as_ptr(),
                self.data.as_ptr().add(row * self.item_size()),
                self.item_size(),
            );
        }
    }

    /// Zero one row.
    pub fn clear_row(&mut self, row: usize) {
        assert!(row < self.capacity);
        // SAFETY: row is in bounds.
        unsafe {
            ptr::write_bytes(
                self.data.as_ptr().add(row * self.item_size()),
                0,
                self.item_size(),
            );
        }
    }

    /// Copy row `src` over row `dst` within this column.
    pub fn copy_within(&mut self, src: usize, dst: usize) {
        assert!(src < self.capacity && dst < self.capacity);
        if src == dst {
            return;
        }
        let size = self.item_size();
        // SAFETY: both rows are in bounds and distinct, so they don't overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                self.data.as_ptr().add(src * size),
                self.data.as_ptr().add(dst * size),
                size,
            );
        }
    }

    /// The first `len` rows as `&[T]`.
    pub fn typed<T: 'static>(&self, len: usize) -> Result<&[T], EcsError> {
        self.check_type::<T>()?;
        assert!(len <= self.capacity);
        // SAFETY: type checked above; the allocation is aligned for T and
        // holds initialized Pod values.
        Ok(unsafe { std::slice::from_raw_parts(self.data.as_ptr() as *const T, len) })
    }

    /// The first `len` rows as `&mut [T]`.
    pub fn typed_mut<T: 'static>(&mut self, len: usize) -> Result<&mut [T], EcsError> {
        self.check_type::<T>()?;
        assert!(len <= self.capacity);
        // SAFETY: as `typed`, and `&mut self` guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr() as *mut T, len) })
    }

    /// Mutable slice derived from a shared borrow.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other reference to these rows exists for
    /// the lifetime of the returned slice (the chunk view's borrow tracker
    /// enforces this).
    pub(crate) unsafe fn typed_mut_unchecked<T: 'static>(
        &self,
        len: usize,
    ) -> Result<&mut [T], EcsError> {
        self.check_type::<T>()?;
        assert!(len <= self.capacity);
        Ok(std::slice::from_raw_parts_mut(self.data.as_ptr() as *mut T, len))
    }

    fn check_type<T: 'static>(&self) -> Result<(), EcsError> {
        if self.info.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(EcsError::TypeMismatch {
                component: self.info.qualified_name(),
                requested: std::any::type_name::<T>(),
            })
        }
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.info.size, self.info.align, self.capacity) {
            // SAFETY: allocated in `new` with this exact layout.
            unsafe { alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("component", &self.info.qualified_name())
            .field("capacity", &self.capacity)
            .field("item_size", &self.info.size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A fixed-capacity block of rows within one archetype.
///
/// Invariant: `0 <= len <= capacity`; rows `[0, len)` are live and
/// `entities[row]` names the entity in each of them.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    archetype: ArchetypeId,
    capacity: usize,
    signature: Arc<[ComponentTypeId]>,
    entities: Vec<Entity>,
    /// Invariant: `columns[i].component() == signature[i]`.
    columns: Vec<Column>,
}

impl Chunk {
    fn new(
        id: ChunkId,
        archetype: ArchetypeId,
        signature: Arc<[ComponentTypeId]>,
        layouts: &[ComponentInfo],
        capacity: usize,
    ) -> Self {
        Self {
            id,
            archetype,
            capacity,
            signature,
            entities: Vec::with_capacity(capacity),
            columns: layouts.iter().map(|info| Column::new(info, capacity)).collect(),
        }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn archetype_id(&self) -> ArchetypeId {
        self.archetype
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entities.len() == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Row -> entity column for the live rows.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[inline]
    pub fn signature(&self) -> &[ComponentTypeId] {
        &self.signature
    }

    /// Binary search for the column holding `type_id`.
    #[inline]
    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.signature.binary_search(&type_id).ok()
    }

    #[inline]
    pub fn column(&self, col_index: usize) -> Option<&Column> {
        self.columns.get(col_index)
    }

    #[inline]
    pub(crate) fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Live rows of column `col_index` as a typed read-only span.
    pub fn column_span<T: 'static>(&self, col_index: usize) -> Result<&[T], EcsError> {
        let column = self.columns.get(col_index).ok_or(EcsError::MissingColumn {
            archetype: self.archetype,
            component: None,
        })?;
        column.typed(self.entities.len())
    }

    /// Live rows of column `col_index` as a typed mutable span.
    pub fn column_span_mut<T: 'static>(&mut self, col_index: usize) -> Result<&mut [T], EcsError> {
        let len = self.entities.len();
        let archetype = self.archetype;
        let column = self
            .columns
            .get_mut(col_index)
            .ok_or(EcsError::MissingColumn {
                archetype,
                component: None,
            })?;
        column.typed_mut(len)
    }

    /// Append a row for `entity` with every column zeroed. Returns the row.
    fn push(&mut self, entity: Entity) -> usize {
        debug_assert!(!self.is_full());
        let row = self.entities.len();
        self.entities.push(entity);
        for column in &mut self.columns {
            column.clear_row(row);
        }
        row
    }

    /// Remove `row` by moving the last row into it.
    ///
    /// Returns the entity that now occupies `row`, or `None` if `row` was the
    /// last one.
    fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.copy_within(last, row);
        }
        (row < last).then(|| self.entities[row])
    }

    /// Overwrite the value of `type_id` in `row`.
    pub(crate) fn write_component(
        &mut self,
        row: usize,
        type_id: ComponentTypeId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        let col = self.column_index(type_id).ok_or(EcsError::MissingColumn {
            archetype: self.archetype,
            component: Some(type_id),
        })?;
        self.columns[col].write_row(row, bytes);
        Ok(())
    }

    /// Bytes of the `type_id` value in `row`.
    pub fn component_bytes(&self, row: usize, type_id: ComponentTypeId) -> Option<&[u8]> {
        let col = self.column_index(type_id)?;
        (row < self.len()).then(|| self.columns[col].row_bytes(row))
    }

    /// Copy every column shared with `src` from `src_row` into `dst_row`.
    fn copy_shared_from(&mut self, dst_row: usize, src: &Chunk, src_row: usize) {
        // Both signatures are sorted: merge-walk them.
        let (mut i, mut j) = (0, 0);
        while i < self.signature.len() && j < src.signature.len() {
            match self.signature[i].cmp(&src.signature[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    self.columns[i].write_row(dst_row, src.columns[j].row_bytes(src_row));
                    i += 1;
                    j += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All entities sharing one component signature, stored in chunks.
///
/// Empty chunks and empty archetypes are kept for reuse; nothing here ever
/// frees a chunk.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    /// Sorted, deduplicated component type ids.
    signature: Arc<[ComponentTypeId]>,
    /// Invariant: `layouts[i].id == signature[i]`.
    layouts: Vec<ComponentInfo>,
    chunk_capacity: usize,
    chunks: Vec<Chunk>,
    entity_count: usize,
}

impl Archetype {
    /// Create an empty archetype. `layouts` must be sorted by id with no
    /// duplicates.
    pub fn new(id: ArchetypeId, layouts: Vec<ComponentInfo>, chunk_capacity: usize) -> Self {
        debug_assert!(layouts.windows(2).all(|w| w[0].id < w[1].id));
        assert!(chunk_capacity > 0, "chunk capacity must be non-zero");
        let signature: Arc<[ComponentTypeId]> = layouts.iter().map(|l| l.id).collect();
        Self {
            id,
            signature,
            layouts,
            chunk_capacity,
            chunks: Vec::new(),
            entity_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The sorted signature.
    #[inline]
    pub fn signature(&self) -> &[ComponentTypeId] {
        &self.signature
    }

    /// Metadata for each signature entry, in signature order.
    #[inline]
    pub fn layouts(&self) -> &[ComponentInfo] {
        &self.layouts
    }

    /// Column index of `type_id`, by binary search over the signature.
    #[inline]
    pub fn try_get_column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.signature.binary_search(&type_id).ok()
    }

    #[inline]
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.try_get_column_index(type_id).is_some()
    }

    /// Number of live entities across all chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.entity_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    #[inline]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[inline]
    pub(crate) fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0 as usize)
    }

    #[inline]
    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id.0 as usize)
    }

    /// Append a zeroed row for `entity` to the first chunk with space,
    /// appending a new chunk if all are full.
    pub(crate) fn push_entity(&mut self, entity: Entity) -> (ChunkId, usize) {
        let index = match self.chunks.iter().position(|c| !c.is_full()) {
            Some(index) => index,
            None => {
                let id = ChunkId(self.chunks.len() as u32);
                self.chunks.push(Chunk::new(
                    id,
                    self.id,
                    Arc::clone(&self.signature),
                    &self.layouts,
                    self.chunk_capacity,
                ));
                debug!(
                    archetype = %self.id,
                    chunk = id.0,
                    capacity = self.chunk_capacity,
                    "allocated chunk"
                );
                self.chunks.len() - 1
            }
        };
        let row = self.chunks[index].push(entity);
        self.entity_count += 1;
        (ChunkId(index as u32), row)
    }

    /// Swap-remove a row. Returns the entity moved into `row`, if any.
    pub(crate) fn remove_row(&mut self, chunk: ChunkId, row: usize) -> Option<Entity> {
        let moved = self.chunks[chunk.0 as usize].swap_remove(row);
        self.entity_count -= 1;
        moved
    }

    /// Copy the columns shared with `src` from `(src_chunk, src_row)` into
    /// `(dst_chunk, dst_row)` of this archetype.
    pub(crate) fn copy_shared_from(
        &mut self,
        dst_chunk: ChunkId,
        dst_row: usize,
        src: &Archetype,
        src_chunk: ChunkId,
        src_row: usize,
    ) {
        let source = &src.chunks[src_chunk.0 as usize];
        self.chunks[dst_chunk.0 as usize].copy_shared_from(dst_row, source, src_row);
    }

    /// Recompute the live count from the chunks (validator cross-check).
    pub fn counted_rows(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
