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

//! Archetype: the set of chunks backing every entity that shares one
//! exact component set, plus the archetype graph edges used to route
//! add/remove-component transitions without recomputing a signature from
//! scratch every time.
//!
//! The graph is lazy and never removes an edge: a `TypeId -> archetype
//! index` edge, once recorded, stays even if that archetype later dies,
//! because the index space itself never shrinks (dead archetypes are
//! tombstoned by `World`, not removed). Edges are keyed by component id
//! rather than holding an `Archetype` pointer, which sidesteps the
//! ownership cycle a direct archetype-to-archetype reference would
//! create.

use std::any::TypeId;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::chunk::{Chunk, ChunkLayout};
use crate::chunk_alloc::ChunkAllocator;
use crate::descriptor::ComponentDescriptor;
use crate::entity::EntityId;

/// Whether a component lives once per entity (`Generic`, the common
/// case) or once per chunk, shared by every entity that chunk holds
/// (`Unique`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentKind {
    Generic,
    Unique,
}

/// Upper bound on the number of distinct components (generic + unique
/// combined) an archetype's signature may carry. Keeps the chunk layout
/// computation and the `SmallVec` signatures cheap; it's a generous
/// ceiling in practice, not a tuning knob.
pub const MAX_COMPONENTS_PER_ARCHETYPE: usize = 32;

/// The exact, sorted component set an archetype was created for.
pub type Signature = SmallVec<[(TypeId, ComponentKind); 8]>;

pub fn sorted_signature(mut sig: Signature) -> Signature {
    sig.sort_unstable();
    sig
}

/// Lifecycle state tracked per archetype (see `World`'s garbage
/// collection pass): archetypes that lose their last entity start
/// counting down before being torn down, so a spawn/despawn churn on the
/// same signature doesn't thrash allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchetypeState {
    Alive,
    Dying { since_tick: u32 },
    Dead,
}

pub struct Archetype {
    signature: Signature,
    generic_descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
    unique_descriptors: Arc<Vec<Arc<ComponentDescriptor>>>,
    layout: Arc<ChunkLayout>,
    chunks: Vec<Option<Chunk>>,
    /// Indices of chunks known to have spare capacity. Only an
    /// optimization for the common unique-free case; when the archetype
    /// carries unique components, insertion falls back to scanning all
    /// chunks for a value-compatible one.
    partial: Vec<usize>,
    add_edges: FxHashMap<TypeId, usize>,
    remove_edges: FxHashMap<TypeId, usize>,
    state: ArchetypeState,
}

impl Archetype {
    pub fn new(
        signature: Signature,
        generic_descriptors: Vec<Arc<ComponentDescriptor>>,
        unique_descriptors: Vec<Arc<ComponentDescriptor>>,
    ) -> Self {
        let layout = Arc::new(ChunkLayout::compute(&generic_descriptors, &unique_descriptors));
        Self {
            signature,
            generic_descriptors: Arc::new(generic_descriptors),
            unique_descriptors: Arc::new(unique_descriptors),
            layout,
            chunks: Vec::new(),
            partial: Vec::new(),
            add_edges: FxHashMap::default(),
            remove_edges: FxHashMap::default(),
            state: ArchetypeState::Alive,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn has_unique_components(&self) -> bool {
        !self.unique_descriptors.is_empty()
    }

    pub fn generic_descriptors(&self) -> &[Arc<ComponentDescriptor>] {
        &self.generic_descriptors
    }

    pub fn unique_descriptors(&self) -> &[Arc<ComponentDescriptor>] {
        &self.unique_descriptors
    }

    pub fn generic_descriptors_handle(&self) -> Arc<Vec<Arc<ComponentDescriptor>>> {
        self.generic_descriptors.clone()
    }

    pub fn unique_descriptors_handle(&self) -> Arc<Vec<Arc<ComponentDescriptor>>> {
        self.unique_descriptors.clone()
    }

    pub fn unique_descriptors_len(&self) -> usize {
        self.unique_descriptors.len()
    }

    pub fn generic_column_index(&self, type_id: TypeId) -> Option<usize> {
        self.generic_descriptors.iter().position(|d| d.type_id == type_id)
    }

    pub fn unique_column_index(&self, type_id: TypeId) -> Option<usize> {
        self.unique_descriptors.iter().position(|d| d.type_id == type_id)
    }

    pub fn has_component(&self, type_id: TypeId) -> bool {
        self.signature.iter().any(|(id, _)| *id == type_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().flatten().map(Chunk::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index).and_then(Option::as_ref)
    }

    pub fn chunk_mut(&mut self, index: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(index).and_then(Option::as_mut)
    }

    pub fn chunk_slots(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter_map(Option::as_ref)
    }

    pub fn add_edge(&self, type_id: TypeId) -> Option<usize> {
        self.add_edges.get(&type_id).copied()
    }

    pub fn set_add_edge(&mut self, type_id: TypeId, archetype_id: usize) {
        self.add_edges.insert(type_id, archetype_id);
    }

    pub fn remove_edge(&self, type_id: TypeId) -> Option<usize> {
        self.remove_edges.get(&type_id).copied()
    }

    pub fn set_remove_edge(&mut self, type_id: TypeId, archetype_id: usize) {
        self.remove_edges.insert(type_id, archetype_id);
    }

    pub fn state(&self) -> ArchetypeState {
        self.state
    }

    pub fn mark_dying(&mut self, since_tick: u32) {
        if self.state == ArchetypeState::Alive {
            self.state = ArchetypeState::Dying { since_tick };
        }
    }

    pub fn mark_alive(&mut self) {
        self.state = ArchetypeState::Alive;
    }

    pub fn mark_dead(&mut self) {
        self.state = ArchetypeState::Dead;
    }

    pub fn is_dead(&self) -> bool {
        self.state == ArchetypeState::Dead
    }

    fn alloc_chunk(&mut self, allocator: &mut ChunkAllocator) -> usize {
        let handle = allocator.alloc(self.layout.size_class);
        let chunk = Chunk::new(
            handle,
            self.layout.clone(),
            self.generic_descriptors.clone(),
            self.unique_descriptors.clone(),
        );
        if let Some(slot) = self.chunks.iter().position(Option::is_none) {
            self.chunks[slot] = Some(chunk);
            slot
        } else {
            self.chunks.push(Some(chunk));
            self.chunks.len() - 1
        }
    }

    /// Allocates a row for `entity` in this (unique-component-free)
    /// archetype, reusing a chunk with spare capacity or creating one.
    pub fn allocate_row_generic(
        &mut self,
        entity: EntityId,
        allocator: &mut ChunkAllocator,
    ) -> (usize, usize) {
        debug_assert!(self.unique_descriptors.is_empty());
        let chunk_index = match self.partial.last().copied() {
            Some(idx) => idx,
            None => {
                let idx = self.alloc_chunk(allocator);
                self.partial.push(idx);
                idx
            }
        };
        let chunk = self.chunks[chunk_index].as_mut().unwrap();
        let row = chunk.push_entity(entity);
        if chunk.is_full() {
            self.partial.pop();
        }
        (chunk_index, row)
    }

    /// Allocates a row for `entity` whose unique-component values must
    /// equal `unique_values` (one raw pointer per unique descriptor, in
    /// `unique_descriptors` order). Reuses a compatible chunk if one
    /// exists, otherwise creates a fresh chunk seeded with those values.
    ///
    /// # Safety
    /// Each pointer in `unique_values` must point to a validly
    /// initialized value of the matching unique descriptor's type.
    pub unsafe fn allocate_row_unique(
        &mut self,
        entity: EntityId,
        allocator: &mut ChunkAllocator,
        unique_values: &[*const u8],
    ) -> (usize, usize) {
        debug_assert_eq!(unique_values.len(), self.unique_descriptors.len());

        for (idx, slot) in self.chunks.iter_mut().enumerate() {
            if let Some(chunk) = slot {
                if chunk.is_full() {
                    continue;
                }
                let matches = unique_values
                    .iter()
                    .enumerate()
                    .all(|(col, &ptr)| chunk.unique_eq(col, ptr));
                if matches {
                    let row = chunk.push_entity(entity);
                    return (idx, row);
                }
            }
        }

        let chunk_index = self.alloc_chunk(allocator);
        let chunk = self.chunks[chunk_index].as_mut().unwrap();
        chunk.init_unique(unique_values);
        let row = chunk.push_entity(entity);
        (chunk_index, row)
    }

    /// Removes the entity at `chunk_index`/`row`, returning every entity
    /// that had to move to close the hole, paired with its new row. A
    /// chunk that empties out is marked dying rather than freed
    /// immediately — `collect_dying_chunks` frees it once its countdown
    /// elapses, unless it's revived by a new entity first.
    pub fn remove_row(
        &mut self,
        chunk_index: usize,
        row: usize,
        tick: u32,
    ) -> SmallVec<[(EntityId, usize); 2]> {
        let chunk = self.chunks[chunk_index].as_mut().expect("removing from a freed chunk slot");
        let was_full = chunk.is_full();
        let moves = unsafe { chunk.swap_remove(row) };

        if chunk.is_empty() {
            chunk.mark_dying(tick);
            self.partial.retain(|&i| i != chunk_index);
        } else if was_full {
            self.partial.push(chunk_index);
        }

        moves
    }

    /// Closes the hole left by an entity already moved (or dropped)
    /// column-by-column out of `chunk_index`/`row`, without re-running
    /// destructors on it. Used by `World` when migrating an entity to a
    /// different archetype. Same dying-chunk bookkeeping as `remove_row`.
    pub fn finish_row_removal(
        &mut self,
        chunk_index: usize,
        row: usize,
        tick: u32,
    ) -> SmallVec<[(EntityId, usize); 2]> {
        let chunk = self.chunks[chunk_index].as_mut().expect("removing from a freed chunk slot");
        let was_full = chunk.is_full();
        let moves = unsafe { chunk.finish_row_removal(row) };

        if chunk.is_empty() {
            chunk.mark_dying(tick);
            self.partial.retain(|&i| i != chunk_index);
        } else if was_full {
            self.partial.push(chunk_index);
        }

        moves
    }

    /// Frees every chunk that has been empty (and unrevived) for at
    /// least `chunk_lifespan` ticks.
    pub fn collect_dying_chunks(&mut self, tick: u32, chunk_lifespan: u32, allocator: &mut ChunkAllocator) {
        for idx in 0..self.chunks.len() {
            let Some(chunk) = self.chunks[idx].as_ref() else {
                continue;
            };
            if !chunk.is_empty() {
                continue;
            }
            let Some(since) = chunk.dying_since() else {
                continue;
            };
            if tick.saturating_sub(since) >= chunk_lifespan {
                let handle = chunk.handle();
                self.chunks[idx] = None;
                allocator.free(handle);
                self.partial.retain(|&i| i != idx);
            }
        }
    }

    fn chunks_unique_match(&self, a: usize, b: usize) -> bool {
        if self.unique_descriptors.is_empty() {
            return true;
        }
        let a = self.chunks[a].as_ref().unwrap();
        let b = self.chunks[b].as_ref().unwrap();
        (0..self.unique_descriptors.len()).all(|col| b.unique_eq(col, a.unique_raw_ptr(col)))
    }

    /// Consolidates sparsely-filled chunks by moving entities out of the
    /// least-full chunk into another compatible chunk with room, up to
    /// `budget` row moves. Returns every relocation as
    /// `(entity, new_chunk_index, new_row)` so `World` can update its
    /// entity location table; a source chunk that empties out is marked
    /// dying rather than freed immediately, same as `remove_row`.
    pub fn defrag(&mut self, mut budget: usize, tick: u32) -> Vec<(EntityId, usize, usize)> {
        let mut moves = Vec::new();

        while budget > 0 {
            let Some(src_idx) = self.find_defrag_source() else {
                break;
            };
            let Some(dst_idx) = self.find_defrag_destination(src_idx) else {
                break;
            };

            let (src_slice, dst_slice) = if src_idx < dst_idx {
                let (left, right) = self.chunks.split_at_mut(dst_idx);
                (&mut left[src_idx], &mut right[0])
            } else {
                let (left, right) = self.chunks.split_at_mut(src_idx);
                (&mut right[0], &mut left[dst_idx])
            };
            let src_chunk = src_slice.as_mut().unwrap();
            let dst_chunk = dst_slice.as_mut().unwrap();

            let row = src_chunk.len() - 1;
            let entity = src_chunk.entities()[row];
            let (new_row, collateral) = unsafe { src_chunk.relocate_row(row, dst_chunk) };
            moves.push((entity, dst_idx, new_row));
            if let Some((collateral_entity, collateral_row)) = collateral {
                moves.push((collateral_entity, dst_idx, collateral_row));
            }
            budget -= 1;

            if src_chunk.is_empty() {
                src_chunk.mark_dying(tick);
                self.partial.retain(|&i| i != src_idx);
            }
            if dst_chunk.is_full() {
                self.partial.retain(|&i| i != dst_idx);
            }
        }

        moves
    }

    fn find_defrag_source(&self) -> Option<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|c| (idx, c)))
            .filter(|(_, c)| c.len() > 0 && c.len() * 2 < c.capacity())
            .min_by_key(|(_, c)| c.len())
            .map(|(idx, _)| idx)
    }

    fn find_defrag_destination(&self, exclude: usize) -> Option<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|c| (idx, c)))
            .filter(|(idx, c)| *idx != exclude && !c.is_full())
            .filter(|(idx, _)| self.chunks_unique_match(exclude, *idx))
            .max_by_key(|(_, c)| c.len())
            .map(|(idx, _)| idx)
    }
}
