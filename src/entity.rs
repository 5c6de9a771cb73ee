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

//! Entity identifiers and location metadata.

use slotmap::new_key_type;

new_key_type! {
    /// Unique entity identifier backed by slotmap's generational keys.
    ///
    /// The key packs an index and a generation counter (the "tag" in
    /// spec terms); a stale handle whose generation doesn't match the
    /// live one is simply absent from the slot map, which is exactly the
    /// "out-of-range ids return a bad sentinel, `valid` is the official
    /// membership test" behavior called for by the runtime.
    pub struct EntityId;
}

/// Where an entity's components physically live: which archetype, which
/// chunk within that archetype, and which row within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype_id: usize,
    pub chunk_index: usize,
    pub row: usize,
}

impl EntityLocation {
    pub const PLACEHOLDER: EntityLocation = EntityLocation {
        archetype_id: usize::MAX,
        chunk_index: usize::MAX,
        row: usize::MAX,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_distinguishable() {
        let loc = EntityLocation {
            archetype_id: 0,
            chunk_index: 0,
            row: 0,
        };
        assert_ne!(loc, EntityLocation::PLACEHOLDER);
    }
}
