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

//! Query building and the query cache.
//!
//! A `Query` is a small rule set (`all`/`any`/`none`/`changed_since`)
//! built at runtime and compiled into a `QueryInfo`, which remembers the
//! archetypes it matched and only re-tests archetypes created since the
//! last compile — the same incremental-matching trick the teacher's
//! `CachedQueryResult` used, generalized from a type-level signature to
//! this runtime rule set. A 64-bit "matcher hash" (one bit per component
//! id, OR'd together) lets `World` reject almost every archetype with a
//! single AND before falling back to the exact `all`/`any`/`none` test.
//!
//! Change detection needs no caller-supplied tick: a `QueryInfo` records
//! the world version it last iterated at (`world_version_seen`) and
//! treats that as the baseline for its own next call, so the same query
//! run twice in a row with nothing written in between naturally visits
//! zero chunks.

use std::any::TypeId;
use std::cell::RefCell;

use ahash::AHashMap;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::Archetype;
use crate::chunk::Chunk;
use crate::component::Component;
use crate::entity::EntityId;

/// Which rows of a matching chunk an iteration should visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    /// Every row, regardless of its enabled flag.
    All,
    /// Only rows whose entity is enabled (the default for gameplay
    /// systems: disabled entities are "soft deleted").
    EnabledOnly,
    /// Only rows whose entity has been explicitly disabled.
    DisabledOnly,
}

fn matcher_bit(type_id: TypeId) -> u64 {
    // A TypeId has no public bit-index, so route it through a hash and
    // fold into 6 bits of position. False positives (two types landing
    // on the same bit) only ever cost an extra exact check in
    // `matches`, never an incorrect result.
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    type_id.hash(&mut hasher);
    1u64 << (hasher.finish() % 64)
}

fn matcher_hash(ids: &[TypeId]) -> u64 {
    ids.iter().fold(0u64, |acc, id| acc | matcher_bit(*id))
}

/// A runtime-built query rule set.
#[derive(Debug, Clone, Default)]
pub struct Query {
    all: Vec<TypeId>,
    any: Vec<TypeId>,
    none: Vec<TypeId>,
    changed: Vec<TypeId>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the archetype to carry `T`.
    pub fn all<T: Component>(mut self) -> Self {
        self.all.push(TypeId::of::<T>());
        self
    }

    /// Require the archetype to carry at least one of the `any`-filters
    /// added across this builder chain.
    pub fn any<T: Component>(mut self) -> Self {
        self.any.push(TypeId::of::<T>());
        self
    }

    /// Exclude archetypes that carry `T`.
    pub fn none<T: Component>(mut self) -> Self {
        self.none.push(TypeId::of::<T>());
        self
    }

    /// Only visit chunks whose `T` column has been written since this
    /// exact query was last iterated (see the module docs on
    /// auto-baselining — there's no tick to pass in).
    pub fn changed_since<T: Component>(mut self) -> Self {
        self.changed.push(TypeId::of::<T>());
        self
    }

    fn matcher_hash(&self) -> u64 {
        matcher_hash(&self.all) | matcher_hash(&self.any)
    }

    fn signature_key(&self) -> QuerySignature {
        let mut all = self.all.clone();
        let mut any = self.any.clone();
        let mut none = self.none.clone();
        let mut changed = self.changed.clone();
        all.sort_unstable();
        any.sort_unstable();
        none.sort_unstable();
        changed.sort_unstable();
        QuerySignature { all, any, none, changed }
    }

    fn matches(&self, archetype: &Archetype) -> bool {
        if !self.all.iter().all(|t| archetype.has_component(*t)) {
            return false;
        }
        if !self.any.is_empty() && !self.any.iter().any(|t| archetype.has_component(*t)) {
            return false;
        }
        if self.none.iter().any(|t| archetype.has_component(*t)) {
            return false;
        }
        true
    }

    pub fn compile(&self, archetypes: &[Archetype]) -> QueryInfo {
        let mut info = QueryInfo {
            query: self.clone(),
            matching: Vec::new(),
            seen_archetype_count: 0,
            world_version_seen: 0,
        };
        info.update(archetypes);
        info
    }
}

/// Cache key for deduplicating compiled queries: the rule lists, sorted
/// so logically-identical `Query`s (built in any field order) share one
/// cache entry — and so one `changed_since` rule set keeps its own
/// baseline independent of any other shape of query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    all: Vec<TypeId>,
    any: Vec<TypeId>,
    none: Vec<TypeId>,
    changed: Vec<TypeId>,
}

/// A compiled query: the matching archetype list plus enough state to
/// extend that list incrementally as new archetypes are created.
pub struct QueryInfo {
    query: Query,
    matching: Vec<usize>,
    seen_archetype_count: usize,
    /// World version as of this query's last iteration. Read-only
    /// queries (`matching_archetypes`) don't touch it; `each_chunk` and
    /// everything built on it advance it to the version passed in once
    /// the visit completes.
    world_version_seen: u32,
}

impl QueryInfo {
    pub fn update(&mut self, archetypes: &[Archetype]) {
        for (idx, archetype) in archetypes.iter().enumerate().skip(self.seen_archetype_count) {
            if self.query.matches(archetype) {
                self.matching.push(idx);
            }
        }
        self.seen_archetype_count = archetypes.len();
    }

    pub fn matching_archetypes(&self) -> &[usize] {
        &self.matching
    }

    /// Checks `chunk` against this query's `changed_since` filters,
    /// using the baseline recorded at the end of the previous iteration.
    fn chunk_passes_change_filter(&self, chunk: &Chunk) -> bool {
        self.query
            .changed
            .iter()
            .all(|type_id| match chunk.column_index(*type_id) {
                Some(col) => chunk.version_of(col) > self.world_version_seen,
                None => false,
            })
    }

    fn row_passes_mode(chunk: &Chunk, row: usize, mode: IterMode) -> bool {
        match mode {
            IterMode::All => true,
            IterMode::EnabledOnly => chunk.is_enabled(row),
            IterMode::DisabledOnly => !chunk.is_enabled(row),
        }
    }

    /// Visits every matching, filter-passing chunk read-only, locking
    /// each one for the duration of its callback so a nested structural
    /// op on the same chunk trips its `debug_assert!`. `world_version` is
    /// the caller's current world version; once every chunk has been
    /// visited it becomes this query's new change-detection baseline.
    pub fn each_chunk<'a>(
        &mut self,
        archetypes: &'a [Archetype],
        mode: IterMode,
        world_version: u32,
        mut f: impl FnMut(&'a Chunk),
    ) {
        #[cfg(feature = "profiling")]
        let span = info_span!("query.each_chunk", matched = self.matching.len());
        #[cfg(feature = "profiling")]
        let _guard = span.enter();

        for &archetype_idx in &self.matching {
            let archetype = &archetypes[archetype_idx];
            for chunk in archetype.chunks() {
                if !self.chunk_passes_change_filter(chunk) {
                    continue;
                }
                if mode != IterMode::All
                    && !(0..chunk.len()).any(|row| Self::row_passes_mode(chunk, row, mode))
                {
                    continue;
                }
                chunk.lock();
                f(chunk);
                chunk.unlock();
            }
        }

        self.world_version_seen = world_version;
    }

    /// Visits every entity id passing `mode` and the change filter.
    pub fn each_entity(
        &mut self,
        archetypes: &[Archetype],
        mode: IterMode,
        world_version: u32,
        mut f: impl FnMut(EntityId),
    ) {
        self.each_chunk(archetypes, mode, world_version, |chunk| {
            for (row, &entity) in chunk.entities().iter().enumerate() {
                if Self::row_passes_mode(chunk, row, mode) {
                    f(entity);
                }
            }
        });
    }

    pub fn count(&mut self, archetypes: &[Archetype], mode: IterMode, world_version: u32) -> usize {
        let mut total = 0;
        self.each_entity(archetypes, mode, world_version, |_| total += 1);
        total
    }

    pub fn is_empty(&mut self, archetypes: &[Archetype], mode: IterMode, world_version: u32) -> bool {
        self.count(archetypes, mode, world_version) == 0
    }
}

/// Per-`World` cache of compiled queries, keyed by their rule-set
/// signature so the same `Query` built twice shares one `QueryInfo` —
/// and its change-detection baseline.
#[derive(Default)]
pub struct QueryCache {
    cache: RefCell<AHashMap<QuerySignature, QueryInfo>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the matching archetype indices for `query`, compiling and
    /// caching it on first use and incrementally updating it afterward.
    pub fn matching_archetypes(&self, query: &Query, archetypes: &[Archetype]) -> Vec<usize> {
        let _ = query.matcher_hash(); // superset pre-filter is folded into `matches`
        let key = query.signature_key();
        let mut cache = self.cache.borrow_mut();
        let info = cache.entry(key).or_insert_with(|| query.compile(&[]));
        info.update(archetypes);
        info.matching.clone()
    }

    /// Visits every matching, filter-passing chunk read-only, compiling
    /// and caching `query` on first use.
    pub fn each_chunk<'a>(
        &self,
        query: &Query,
        archetypes: &'a [Archetype],
        mode: IterMode,
        world_version: u32,
        f: impl FnMut(&'a Chunk),
    ) {
        let key = query.signature_key();
        let mut cache = self.cache.borrow_mut();
        let info = cache.entry(key).or_insert_with(|| query.compile(&[]));
        info.update(archetypes);
        info.each_chunk(archetypes, mode, world_version, f);
    }

    /// Visits every entity id passing `mode` and the change filter.
    pub fn each_entity(
        &self,
        query: &Query,
        archetypes: &[Archetype],
        mode: IterMode,
        world_version: u32,
        f: impl FnMut(EntityId),
    ) {
        let key = query.signature_key();
        let mut cache = self.cache.borrow_mut();
        let info = cache.entry(key).or_insert_with(|| query.compile(&[]));
        info.update(archetypes);
        info.each_entity(archetypes, mode, world_version, f);
    }

    pub fn count(&self, query: &Query, archetypes: &[Archetype], mode: IterMode, world_version: u32) -> usize {
        let key = query.signature_key();
        let mut cache = self.cache.borrow_mut();
        let info = cache.entry(key).or_insert_with(|| query.compile(&[]));
        info.update(archetypes);
        info.count(archetypes, mode, world_version)
    }

    pub fn query_is_empty(&self, query: &Query, archetypes: &[Archetype], mode: IterMode, world_version: u32) -> bool {
        self.count(query, archetypes, mode, world_version) == 0
    }

    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{sorted_signature, Archetype, ComponentKind};
    use crate::chunk_alloc::ChunkAllocator;
    use crate::descriptor::ComponentDescriptorCache;

    fn archetype_with<T: Component>(cache: &mut ComponentDescriptorCache) -> Archetype {
        let d = cache.get_or_register::<T>();
        let sig = sorted_signature(smallvec::smallvec![(d.type_id, ComponentKind::Generic)]);
        Archetype::new(sig, vec![d], vec![])
    }

    #[test]
    fn all_filter_excludes_archetypes_missing_the_component() {
        let mut cache = ComponentDescriptorCache::new();
        let with_u32 = archetype_with::<u32>(&mut cache);
        let with_f32 = archetype_with::<f32>(&mut cache);
        let archetypes = vec![with_u32, with_f32];

        let q = Query::new().all::<u32>();
        let info = q.compile(&archetypes);
        assert_eq!(info.matching_archetypes(), &[0]);
    }

    #[test]
    fn none_filter_excludes_archetypes_carrying_the_component() {
        let mut cache = ComponentDescriptorCache::new();
        let with_u32 = archetype_with::<u32>(&mut cache);
        let archetypes = vec![with_u32];

        let q = Query::new().none::<u32>();
        let info = q.compile(&archetypes);
        assert!(info.matching_archetypes().is_empty());
    }

    #[test]
    fn each_entity_respects_enabled_mode() {
        let mut cache = ComponentDescriptorCache::new();
        let mut allocator = ChunkAllocator::new();
        let mut archetype = archetype_with::<u32>(&mut cache);
        let e0 = EntityId::default();
        let (c0, r0) = archetype.allocate_row_generic(e0, &mut allocator);
        archetype.chunk_mut(c0).unwrap().set_enabled(r0, false);
        let archetypes = vec![archetype];

        let q = Query::new().all::<u32>();
        let mut info = q.compile(&archetypes);

        let mut enabled_count = 0;
        info.each_entity(&archetypes, IterMode::EnabledOnly, 0, |_| enabled_count += 1);
        assert_eq!(enabled_count, 0);

        let mut all_count = 0;
        info.each_entity(&archetypes, IterMode::All, 0, |_| all_count += 1);
        assert_eq!(all_count, 1);
    }

    #[test]
    fn any_only_query_matches_archetypes_holding_at_least_one_any_component() {
        let mut cache = ComponentDescriptorCache::new();
        let with_u32 = archetype_with::<u32>(&mut cache);
        let with_f32 = archetype_with::<f32>(&mut cache);
        let with_i64 = archetype_with::<i64>(&mut cache);
        let archetypes = vec![with_u32, with_f32, with_i64];

        let q = Query::new().any::<u32>().any::<f32>();
        let info = q.compile(&archetypes);
        assert_eq!(info.matching_archetypes(), &[0, 1]);
    }

    #[test]
    fn none_only_query_matches_every_archetype_including_the_empty_one() {
        let mut cache = ComponentDescriptorCache::new();
        let empty = Archetype::new(sorted_signature(smallvec::smallvec![]), vec![], vec![]);
        let with_u32 = archetype_with::<u32>(&mut cache);
        let archetypes = vec![empty, with_u32];

        let q = Query::new().none::<f32>();
        let info = q.compile(&archetypes);
        assert_eq!(info.matching_archetypes(), &[0, 1]);
    }

    #[test]
    fn query_cache_reuses_entries_for_equivalent_queries() {
        let cache = QueryCache::new();
        let archetypes: Vec<Archetype> = Vec::new();
        let a = Query::new().all::<u32>();
        let b = Query::new().all::<u32>();
        cache.matching_archetypes(&a, &archetypes);
        cache.matching_archetypes(&b, &archetypes);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn repeating_a_changed_since_query_with_no_writes_in_between_sees_nothing() {
        let mut cache = ComponentDescriptorCache::new();
        let mut allocator = ChunkAllocator::new();
        let mut archetype = archetype_with::<u32>(&mut cache);
        let e0 = EntityId::default();
        let (c0, r0) = archetype.allocate_row_generic(e0, &mut allocator);
        archetype.chunk_mut(c0).unwrap().touch_all(1);
        let _ = r0;
        let archetypes = vec![archetype];

        let cache = QueryCache::new();
        let q = Query::new().all::<u32>().changed_since::<u32>();

        assert_eq!(cache.count(&q, &archetypes, IterMode::All, 1), 1);
        assert_eq!(cache.count(&q, &archetypes, IterMode::All, 1), 0);
    }
}
