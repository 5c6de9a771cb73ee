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

//! gaia_ecs - archetype-based Entity Component System core runtime.
//!
//! Entities are rows grouped by archetype (exact component set); each
//! archetype owns fixed-capacity chunks laid out SoA per component. The
//! scheduler, reflection layer, and profiler hooks a full game engine
//! would wrap this in are deliberately out of scope — see `DESIGN.md`.

pub mod archetype;
pub mod chunk;
pub mod chunk_alloc;
pub mod command;
pub mod component;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod query;
pub mod utils;
pub mod world;

pub mod prelude;

// Re-exports for convenience
pub use archetype::{Archetype, ComponentKind};
pub use command::{CommandBuffer, TempEntityId};
pub use component::{Bundle, Component};
pub use descriptor::ComponentDescriptor;
pub use entity::EntityId;
pub use error::{EcsError, Result};
pub use query::{IterMode, Query, QueryCache};
pub use world::{World, WorldConfig};

#[cfg(test)]
mod tests;
