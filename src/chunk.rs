// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A chunk: one allocator block laid out as parallel component arrays
//! (struct-of-arrays) plus an entity-id column, all sharing a single
//! `ChunkLayout` computed once per archetype.
//!
//! A chunk does not own the memory it points into — the `BlockHandle` is
//! just a back-pointer into the `ChunkAllocator`'s pages. Dropping a
//! `Chunk` runs component destructors for any rows still live but leaves
//! the page itself alone; the archetype that owns the chunk is
//! responsible for returning the handle to the allocator.
//!
//! Enabled rows always occupy a contiguous suffix `[first_enabled_index,
//! len)`; disabled rows occupy the contiguous prefix `[0,
//! first_enabled_index)`. `set_enabled` maintains that split with a
//! boundary swap instead of a per-row flag, so "is this row enabled" is a
//! single comparison and default iteration can skip the disabled prefix
//! in one slice instead of testing a bit per row.

use std::any::TypeId;
use std::cell::Cell;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk_alloc::{BlockHandle, SizeClass};
use crate::descriptor::ComponentDescriptor;
use crate::entity::EntityId;
use crate::utils::align_to;

/// Re-entrant lock depth above which a chunk refuses further locking.
/// Seven is enough headroom for a query nested inside up to six other
/// queries/commands touching the same chunk; beyond that it's almost
/// certainly a bug, not a legitimate access pattern.
pub const MAX_LOCK_DEPTH: u8 = 7;

/// Per-archetype, shared by every chunk of that archetype: where the
/// entity-id column and each component column start within a block, and
/// how many rows fit.
pub struct ChunkLayout {
    pub capacity: usize,
    pub size_class: SizeClass,
    entity_offset: usize,
    component_offsets: Vec<usize>,
    /// Offsets of the single, chunk-shared instance of each unique
    /// (per-chunk, not per-entity) component.
    unique_offsets: Vec<usize>,
}

impl ChunkLayout {
    /// Computes column offsets for the given per-entity descriptors plus
    /// one shared slot per unique descriptor, shrinking the assumed row
    /// capacity until every column (each aligned to its own requirement)
    /// fits inside one block.
    pub fn compute(
        descriptors: &[Arc<ComponentDescriptor>],
        unique: &[Arc<ComponentDescriptor>],
    ) -> ChunkLayout {
        let entity_align = std::mem::align_of::<EntityId>();
        let entity_size = std::mem::size_of::<EntityId>();
        let unique_bytes: usize = unique.iter().map(|d| d.size).sum();
        let bytes_per_row: usize =
            entity_size + descriptors.iter().map(|d| d.size).sum::<usize>();
        let max_align = descriptors
            .iter()
            .chain(unique.iter())
            .map(|d| d.align)
            .max()
            .unwrap_or(1)
            .max(entity_align);

        let size_class =
            SizeClass::for_size((bytes_per_row + unique_bytes).max(max_align)).unwrap_or(SizeClass::Large);
        let block_bytes = size_class.block_bytes();

        let mut capacity = ((block_bytes - unique_bytes) / bytes_per_row.max(1)).max(1);
        loop {
            let mut offset = 0usize;
            offset = align_to(offset, entity_align);
            let entity_offset = offset;
            offset += entity_size * capacity;

            let mut component_offsets = Vec::with_capacity(descriptors.len());
            for d in descriptors {
                offset = align_to(offset, d.align);
                component_offsets.push(offset);
                offset += d.size * capacity;
            }

            let mut unique_offsets = Vec::with_capacity(unique.len());
            for d in unique {
                offset = align_to(offset, d.align);
                unique_offsets.push(offset);
                offset += d.size;
            }

            if offset <= block_bytes || capacity <= 1 {
                return ChunkLayout {
                    capacity,
                    size_class,
                    entity_offset,
                    component_offsets,
                    unique_offsets,
                };
            }
            capacity -= 1;
        }
    }
}

/// One block of entity rows for a single archetype.
pub struct Chunk {
    handle: BlockHandle,
    layout: Arc<ChunkLayout>,
    descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
    unique_descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
    unique_initialized: bool,
    len: usize,
    /// Held in a `Cell` so locking can be expressed on a shared reference
    /// — queries only ever observe chunks through `&Chunk` while
    /// iterating, but still need to forbid structural ops for the
    /// duration of a callback.
    lock_depth: Cell<u8>,
    /// World version at which each column was last touched through
    /// `view_mut`; bumped conservatively (false positives allowed, false
    /// negatives are a correctness bug).
    versions: Vec<u32>,
    /// Boundary of the enabled/disabled partition: rows `[0,
    /// first_enabled_index)` are disabled, rows `[first_enabled_index,
    /// len)` are enabled. Maintained by `set_enabled`.
    first_enabled_index: usize,
    /// Set the tick this chunk first became empty; cleared the moment it
    /// receives a new entity. A chunk whose countdown (tracked by the
    /// owning archetype) elapses while still empty is returned to the
    /// allocator.
    dying_since: Option<u32>,
}

impl Chunk {
    pub fn new(
        handle: BlockHandle,
        layout: Arc<ChunkLayout>,
        descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
        unique_descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
    ) -> Self {
        let versions = vec![0; descriptors.len()];
        Self {
            handle,
            layout,
            descriptors,
            unique_initialized: unique_descriptors.is_empty(),
            unique_descriptors,
            len: 0,
            lock_depth: Cell::new(0),
            versions,
            first_enabled_index: 0,
            dying_since: None,
        }
    }

    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.layout.capacity
    }

    pub fn column_index(&self, type_id: TypeId) -> Option<usize> {
        self.descriptors.iter().position(|d| d.type_id == type_id)
    }

    pub fn version_of(&self, column: usize) -> u32 {
        self.versions[column]
    }

    pub fn lock(&self) {
        let depth = self.lock_depth.get();
        debug_assert!(
            depth < MAX_LOCK_DEPTH,
            "chunk lock depth exceeded {MAX_LOCK_DEPTH}; likely a re-entrant query bug"
        );
        self.lock_depth.set(depth + 1);
    }

    pub fn unlock(&self) {
        let depth = self.lock_depth.get();
        debug_assert!(depth > 0, "unlocking a chunk that isn't locked");
        self.lock_depth.set(depth - 1);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    /// Sets the tick a chunk first became empty, unless it's already
    /// marked dying — later calls before revival don't reset the
    /// countdown.
    pub fn mark_dying(&mut self, tick: u32) {
        if self.dying_since.is_none() {
            self.dying_since = Some(tick);
        }
    }

    pub fn dying_since(&self) -> Option<u32> {
        self.dying_since
    }

    /// Stamps every column's version, used right after a row is
    /// allocated into the chunk so the new data reads as "changed" under
    /// the world version it was written at.
    pub fn touch_all(&mut self, version: u32) {
        for v in self.versions.iter_mut() {
            *v = version;
        }
    }

    /// Stamps a single column's version, used for an in-place overwrite
    /// of one component (`World::set_component_raw`) that shouldn't mark
    /// every other column in the row changed too.
    pub fn touch_column(&mut self, column: usize, version: u32) {
        self.versions[column] = version;
    }

    fn entity_base(&self) -> *mut EntityId {
        unsafe { self.handle.ptr.as_ptr().add(self.layout.entity_offset) as *mut EntityId }
    }

    pub fn entities(&self) -> &[EntityId] {
        unsafe { std::slice::from_raw_parts(self.entity_base(), self.len) }
    }

    fn column_base(&self, column: usize) -> *mut u8 {
        unsafe { self.handle.ptr.as_ptr().add(self.layout.component_offsets[column]) }
    }

    fn component_ptr(&self, column: usize, row: usize) -> *mut u8 {
        unsafe { self.column_base(column).add(row * self.descriptors[column].size) }
    }

    /// Raw pointer to the `row`-th element of `column`, for writing a
    /// freshly-moved or freshly-spawned component in place.
    ///
    /// # Safety
    /// `row` must be `< capacity()`; the caller is responsible for
    /// writing a validly-initialized value of the column's component
    /// type.
    pub unsafe fn raw_component_ptr(&self, column: usize, row: usize) -> *mut u8 {
        self.component_ptr(column, row)
    }

    pub fn view<T: 'static>(&self, column: usize) -> &[T] {
        debug_assert_eq!(self.descriptors[column].type_id, TypeId::of::<T>());
        unsafe { std::slice::from_raw_parts(self.column_base(column) as *const T, self.len) }
    }

    pub fn unique_column_index(&self, type_id: TypeId) -> Option<usize> {
        self.unique_descriptors.iter().position(|d| d.type_id == type_id)
    }

    fn unique_base(&self, column: usize) -> *mut u8 {
        unsafe { self.handle.ptr.as_ptr().add(self.layout.unique_offsets[column]) }
    }

    /// Initializes this chunk's shared unique-component slots by copying
    /// from `values`, one raw pointer per unique descriptor in order.
    /// Must be called exactly once, before any entity is pushed.
    ///
    /// # Safety
    /// Each entry of `values` must point to a validly-initialized value
    /// of the corresponding unique descriptor's type.
    pub unsafe fn init_unique(&mut self, values: &[*const u8]) {
        debug_assert!(!self.unique_initialized);
        debug_assert_eq!(values.len(), self.unique_descriptors.len());
        for (col, &src) in values.iter().enumerate() {
            let dst = self.unique_base(col);
            std::ptr::copy_nonoverlapping(src, dst, self.unique_descriptors[col].size);
        }
        self.unique_initialized = true;
    }

    pub fn unique_view<T: 'static>(&self, column: usize) -> &T {
        debug_assert!(self.unique_initialized);
        debug_assert_eq!(self.unique_descriptors[column].type_id, TypeId::of::<T>());
        unsafe { &*(self.unique_base(column) as *const T) }
    }

    pub fn unique_eq(&self, column: usize, other: *const u8) -> bool {
        let eq_fn = self.unique_descriptors[column]
            .eq_fn
            .expect("unique component registered without an eq_fn");
        unsafe { eq_fn(self.unique_base(column), other) }
    }

    pub fn unique_raw_ptr(&self, column: usize) -> *const u8 {
        self.unique_base(column) as *const u8
    }

    /// Like `view` but marks the column changed at `version`. Called any
    /// time code asks for mutable access, regardless of whether it
    /// writes anything — see the module docs on conservative dirtying.
    pub fn view_mut<T: 'static>(&mut self, column: usize, version: u32) -> &mut [T] {
        debug_assert_eq!(self.descriptors[column].type_id, TypeId::of::<T>());
        self.versions[column] = version;
        unsafe { std::slice::from_raw_parts_mut(self.column_base(column) as *mut T, self.len) }
    }

    /// Appends a new row for `entity`, returning its row index. Component
    /// columns are left uninitialized; the caller must write every
    /// column before the row is observable (e.g. via `raw_component_ptr`).
    ///
    /// A chunk that was dying (empty, counting down to being freed) is
    /// revived: receiving an entity clears the countdown unconditionally.
    pub fn push_entity(&mut self, entity: EntityId) -> usize {
        debug_assert!(!self.is_locked(), "structural op on a locked chunk");
        debug_assert!(!self.is_full(), "push_entity called on a full chunk");
        let row = self.len;
        unsafe { self.entity_base().add(row).write(entity) };
        self.len += 1;
        self.dying_since = None;
        row
    }

    pub fn is_enabled(&self, row: usize) -> bool {
        row >= self.first_enabled_index
    }

    /// Moves `row` across the enabled/disabled boundary if it isn't
    /// already on the requested side, by swapping it with whatever
    /// currently sits at the boundary. Returns the row the entity that
    /// was at `row` ends up at, plus the entity displaced by the swap
    /// (and its new row) if one was needed.
    pub fn set_enabled(&mut self, row: usize, enabled: bool) -> (usize, Option<(EntityId, usize)>) {
        debug_assert!(!self.is_locked(), "structural op on a locked chunk");
        debug_assert!(row < self.len);
        let currently_enabled = self.is_enabled(row);
        if currently_enabled == enabled {
            return (row, None);
        }

        let boundary = if enabled {
            self.first_enabled_index - 1
        } else {
            self.first_enabled_index
        };

        let collateral = if row != boundary {
            let (_, displaced) = self.physical_swap_rows(row, boundary);
            Some((displaced, row))
        } else {
            None
        };

        if enabled {
            self.first_enabled_index -= 1;
        } else {
            self.first_enabled_index += 1;
        }

        (boundary, collateral)
    }

    /// Drops the value at `row` in every column, without touching `len`
    /// or the entity-id column.
    fn drop_row(&mut self, row: usize) {
        for (col, descriptor) in self.descriptors.iter().enumerate() {
            if let Some(drop_fn) = descriptor.drop_fn {
                unsafe { drop_fn(self.component_ptr(col, row)) };
            }
        }
    }

    /// Moves every column's value (and the entity id) from `src` to
    /// `dst` without dropping whatever was at `dst` — used when `dst` is
    /// already logically vacated. Returns the entity that was at `src`.
    fn physical_move_overwrite(&mut self, src: usize, dst: usize) -> EntityId {
        for (col, descriptor) in self.descriptors.iter().enumerate() {
            unsafe { (descriptor.move_fn)(self.component_ptr(col, src), self.component_ptr(col, dst)) };
        }
        let moved = unsafe { *self.entity_base().add(src) };
        unsafe { self.entity_base().add(dst).write(moved) };
        moved
    }

    /// True two-way swap of every column's bytes between `a` and `b`.
    /// Safe for any type this crate stores: components are already
    /// required to be memcpy-relocatable for `move_fn` to be sound, and
    /// swapping two valid values byte-for-byte produces two valid values.
    /// Returns the entities that were at `a` and `b` before the swap.
    fn physical_swap_rows(&mut self, a: usize, b: usize) -> (EntityId, EntityId) {
        for (col, descriptor) in self.descriptors.iter().enumerate() {
            let size = descriptor.size;
            let pa = self.component_ptr(col, a);
            let pb = self.component_ptr(col, b);
            unsafe { std::ptr::swap_nonoverlapping(pa, pb, size) };
        }
        let ea = unsafe { *self.entity_base().add(a) };
        let eb = unsafe { *self.entity_base().add(b) };
        unsafe {
            self.entity_base().add(a).write(eb);
            self.entity_base().add(b).write(ea);
        }
        (ea, eb)
    }

    /// Shared tail of `swap_remove`/`finish_row_removal`: closes the hole
    /// at `row`, preserving the enabled/disabled partition. If `row` is
    /// in the disabled prefix, the last disabled slot is moved into the
    /// hole first (keeping the prefix contiguous), then the chunk's
    /// literal last row is moved into whatever slot is now vacant.
    /// Returns every entity that had to move, paired with its new row.
    fn close_hole(&mut self, row: usize) -> SmallVec<[(EntityId, usize); 2]> {
        let mut moves = SmallVec::new();
        let disabled = row < self.first_enabled_index;
        let boundary = if disabled { self.first_enabled_index - 1 } else { row };

        if disabled && row != boundary {
            let moved = self.physical_move_overwrite(boundary, row);
            moves.push((moved, row));
        }

        let last = self.len - 1;
        if boundary != last {
            let moved = self.physical_move_overwrite(last, boundary);
            moves.push((moved, boundary));
        }

        if disabled {
            self.first_enabled_index -= 1;
        }
        self.len -= 1;
        moves
    }

    /// Removes `row`, dropping its component values first, then closes
    /// the hole per `close_hole`. Returns every entity that had to move
    /// to close the hole, paired with its new row.
    ///
    /// # Safety
    /// `row` must be `< len()`.
    pub unsafe fn swap_remove(&mut self, row: usize) -> SmallVec<[(EntityId, usize); 2]> {
        debug_assert!(!self.is_locked(), "structural op on a locked chunk");
        debug_assert!(row < self.len);
        self.drop_row(row);
        self.close_hole(row)
    }

    /// Closes the hole left by `row` once every column's value at that row
    /// has already been moved out or dropped by the caller (used when
    /// migrating an entity to a different archetype, column by column,
    /// rather than removing it outright). Same partition-preserving
    /// bookkeeping as `swap_remove`, minus the destructor pass.
    ///
    /// # Safety
    /// `row` must be `< len()`; every column's value at `row` must already
    /// be moved-out or dropped before this is called.
    pub unsafe fn finish_row_removal(&mut self, row: usize) -> SmallVec<[(EntityId, usize); 2]> {
        debug_assert!(!self.is_locked(), "structural op on a locked chunk");
        debug_assert!(row < self.len);
        self.close_hole(row)
    }

    /// Moves `row`'s components and entity id out of this chunk and into
    /// a fresh row of `dst` (same column layout, i.e. same archetype).
    /// Used by defragmentation, which only ever relocates a chunk's
    /// literal last row, so there's no hole to close on this side beyond
    /// trimming `len`. Preserves `row`'s enabled/disabled side on `dst`.
    ///
    /// # Safety
    /// `row` must be the chunk's last row (`len() - 1`); `dst` must share
    /// this chunk's descriptor list (come from the same archetype) and
    /// have spare capacity.
    pub unsafe fn relocate_row(&mut self, row: usize, dst: &mut Chunk) -> (usize, Option<(EntityId, usize)>) {
        debug_assert!(!self.is_locked(), "structural op on a locked chunk");
        debug_assert!(!dst.is_locked(), "structural op on a locked chunk");
        debug_assert_eq!(row, self.len - 1, "relocate_row only ever relocates a chunk's last row");
        debug_assert!(!dst.is_full());

        let was_enabled = self.is_enabled(row);
        let dst_row = dst.len;
        for (col, descriptor) in self.descriptors.iter().enumerate() {
            (descriptor.move_fn)(self.component_ptr(col, row), dst.component_ptr(col, dst_row));
        }
        let moved_entity = *self.entity_base().add(row);
        dst.entity_base().add(dst_row).write(moved_entity);
        dst.len += 1;

        if !was_enabled {
            self.first_enabled_index -= 1;
        }
        self.len -= 1;

        if was_enabled {
            (dst_row, None)
        } else {
            dst.set_enabled(dst_row, false)
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        for (col, descriptor) in self.descriptors.iter().enumerate() {
            if let Some(drop_fn) = descriptor.drop_fn {
                for row in 0..self.len {
                    unsafe { drop_fn(self.component_ptr(col, row)) };
                }
            }
        }
        if self.unique_initialized {
            for (col, descriptor) in self.unique_descriptors.iter().enumerate() {
                if let Some(drop_fn) = descriptor.drop_fn {
                    unsafe { drop_fn(self.unique_base(col)) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_alloc::ChunkAllocator;
    use crate::descriptor::ComponentDescriptorCache;

    fn make_chunk(descriptors: Vec<Arc<ComponentDescriptor>>, alloc: &mut ChunkAllocator) -> Chunk {
        let layout = Arc::new(ChunkLayout::compute(&descriptors, &[]));
        let handle = alloc.alloc(layout.size_class);
        Chunk::new(handle, layout, Arc::new(descriptors), Arc::new(Vec::new()))
    }

    #[test]
    fn push_and_view_roundtrip() {
        let mut cache = ComponentDescriptorCache::new();
        let mut alloc = ChunkAllocator::new();
        let d = cache.get_or_register::<u32>();
        let mut chunk = make_chunk(vec![d], &mut alloc);

        let e = EntityId::default();
        let row = chunk.push_entity(e);
        unsafe {
            (chunk.raw_component_ptr(0, row) as *mut u32).write(42);
        }
        assert_eq!(chunk.view::<u32>(0)[row], 42);
        alloc.free(chunk.handle());
    }

    #[test]
    fn swap_remove_moves_the_last_row_down() {
        let mut cache = ComponentDescriptorCache::new();
        let mut alloc = ChunkAllocator::new();
        let d = cache.get_or_register::<u32>();
        let mut chunk = make_chunk(vec![d], &mut alloc);

        let e0 = EntityId::default();
        let row0 = chunk.push_entity(e0);
        unsafe { (chunk.raw_component_ptr(0, row0) as *mut u32).write(1) };
        let e1 = EntityId::default();
        let row1 = chunk.push_entity(e1);
        unsafe { (chunk.raw_component_ptr(0, row1) as *mut u32).write(2) };

        let moved = unsafe { chunk.swap_remove(0) };
        assert!(!moved.is_empty());
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk.view::<u32>(0)[0], 2);
        alloc.free(chunk.handle());
    }

    #[test]
    fn lock_depth_is_reentrant() {
        let mut cache = ComponentDescriptorCache::new();
        let mut alloc = ChunkAllocator::new();
        let d = cache.get_or_register::<u32>();
        let chunk = make_chunk(vec![d], &mut alloc);
        chunk.lock();
        chunk.lock();
        assert!(chunk.is_locked());
        chunk.unlock();
        assert!(chunk.is_locked());
        chunk.unlock();
        assert!(!chunk.is_locked());
        alloc.free(chunk.handle());
    }

    #[test]
    fn enable_disable_keeps_the_partition_contiguous() {
        let mut cache = ComponentDescriptorCache::new();
        let mut alloc = ChunkAllocator::new();
        let d = cache.get_or_register::<u32>();
        let mut chunk = make_chunk(vec![d], &mut alloc);

        for i in 0..4u32 {
            let row = chunk.push_entity(EntityId::default());
            unsafe { (chunk.raw_component_ptr(0, row) as *mut u32).write(i) };
        }

        let (new_row, _) = chunk.set_enabled(1, false);
        assert!(!chunk.is_enabled(new_row));
        assert_eq!(chunk.len() - chunk.first_enabled_index, chunk.len() - 1);

        let (new_row2, _) = chunk.set_enabled(new_row, true);
        assert!(chunk.is_enabled(new_row2));
        assert_eq!(chunk.first_enabled_index, 0);
        alloc.free(chunk.handle());
    }

    #[test]
    fn dying_chunk_is_revived_by_a_new_entity() {
        let mut cache = ComponentDescriptorCache::new();
        let mut alloc = ChunkAllocator::new();
        let d = cache.get_or_register::<u32>();
        let mut chunk = make_chunk(vec![d], &mut alloc);
        chunk.mark_dying(5);
        assert_eq!(chunk.dying_since(), Some(5));
        chunk.push_entity(EntityId::default());
        assert_eq!(chunk.dying_since(), None);
        alloc.free(chunk.handle());
    }
}
