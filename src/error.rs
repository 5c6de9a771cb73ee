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

//! Error types.
//!
//! Only the recoverable edge of the runtime returns `Result`: allocation
//! failure, name collisions, and the handful of lookups that are allowed to
//! miss. Invariant violations (duplicate component on spawn, removing a
//! component an archetype doesn't carry, mutating a locked chunk) are
//! `debug_assert!`/`panic!` in the modules that can violate them, not
//! `EcsError` variants.

use std::fmt;

/// ECS error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// No record exists for this entity (already despawned, or never valid).
    EntityNotFound,

    /// The archetype does not carry a component of the requested kind.
    ComponentNotFound,

    /// No archetype exists for the requested component set.
    ArchetypeNotFound,

    /// `World::set_name` was given a name already bound to another entity.
    NameAlreadyTaken(String),

    /// The chunk allocator could not satisfy a page request.
    AllocationFailed,

    /// A command buffer or spawn batch exceeded the configured size limit.
    BatchTooLarge,

    /// An archetype signature would carry more distinct components than
    /// `archetype::MAX_COMPONENTS_PER_ARCHETYPE`.
    TooManyComponents,
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound => write!(f, "entity not found"),
            EcsError::ComponentNotFound => write!(f, "component not found"),
            EcsError::ArchetypeNotFound => write!(f, "archetype not found"),
            EcsError::NameAlreadyTaken(name) => write!(f, "name already taken: {name}"),
            EcsError::AllocationFailed => write!(f, "chunk allocation failed"),
            EcsError::BatchTooLarge => write!(f, "batch size exceeds configured limit"),
            EcsError::TooManyComponents => write!(f, "archetype would exceed the maximum component count"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_distinct() {
        let variants = [
            EcsError::EntityNotFound,
            EcsError::ComponentNotFound,
            EcsError::ArchetypeNotFound,
            EcsError::NameAlreadyTaken("player".into()),
            EcsError::AllocationFailed,
            EcsError::BatchTooLarge,
            EcsError::TooManyComponents,
        ];
        let mut seen = std::collections::HashSet::new();
        for v in &variants {
            assert!(seen.insert(v.to_string()));
        }
    }
}
