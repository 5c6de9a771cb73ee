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

//! Deferred command buffer.
//!
//! `each`-style iteration forbids structural changes to the `World` it is
//! reading from, so callbacks that need to spawn, despawn, or reshape an
//! entity queue the operation here instead. Component payloads are moved
//! into a growable raw byte buffer (capacity rounded up to 128-byte steps)
//! rather than boxed individually, and `commit()` replays every queued
//! operation against a `World` in insertion order before clearing itself.
//!
//! Entities created through the buffer don't exist yet, so `create_entity`
//! hands back a dense, buffer-local `TempEntityId` instead of a real
//! `EntityId`; later commands in the same buffer may target that temp id,
//! and `commit()` resolves it to a real entity as soon as its creation
//! entry replays.

use std::alloc::{alloc, dealloc, Layout};
use std::any::TypeId;
use std::ptr::{self, NonNull};
use std::sync::Arc;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::component::Component;
use crate::descriptor::ComponentDescriptor;
use crate::entity::EntityId;
use crate::error::{EcsError, Result};
use crate::utils::align_to;
pub use crate::world::World;

/// Minimum growth step for the command buffer's internal byte storage.
const ALIGN_STEP: usize = 128;

/// A handle to an entity queued for creation but not yet spawned. Only
/// valid within the `CommandBuffer` that produced it, and only until that
/// buffer's next `commit()` or `clear()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempEntityId(u32);

#[derive(Debug, Clone, Copy)]
enum Target {
    Real(EntityId),
    Temp(u32),
}

struct ComponentSlot {
    descriptor: Arc<ComponentDescriptor>,
    offset: usize,
}

enum Entry {
    CreateEntity { temp_id: u32 },
    CreateEntityFromEntity { temp_id: u32, source: EntityId },
    DeleteEntity(EntityId),
    AddComponent { target: Target, component: ComponentSlot },
    SetComponent { target: Target, component: ComponentSlot },
    RemoveComponent { target: Target, type_id: TypeId },
}

/// Queue of deferred world mutations, replayed all at once by `commit()`.
///
/// Not thread-safe: a buffer is owned by a single logical consumer (one
/// system, one callback), the same way the `World` it targets is.
pub struct CommandBuffer {
    entries: Vec<Entry>,
    storage: NonNull<u8>,
    layout: Layout,
    cursor: usize,
    next_temp_id: u32,
}

unsafe impl Send for CommandBuffer {}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            storage: NonNull::dangling(),
            layout: Layout::from_size_align(0, 8).unwrap(),
            cursor: 0,
            next_temp_id: 0,
        }
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(entries: usize) -> Self {
        Self {
            entries: Vec::with_capacity(entries),
            ..Self::default()
        }
    }

    unsafe fn grow(min_size: usize, align: usize, cursor: usize, storage: NonNull<u8>) -> (NonNull<u8>, Layout) {
        let padded = align_to(min_size, ALIGN_STEP).max(ALIGN_STEP);
        let layout = Layout::from_size_align(padded, align).expect("invalid command buffer layout");
        let new_storage = NonNull::new(alloc(layout)).expect("command buffer allocation failed");
        ptr::copy_nonoverlapping(storage.as_ptr(), new_storage.as_ptr(), cursor);
        (new_storage, layout)
    }

    /// Writes `value` into the byte buffer, growing it if necessary, and
    /// returns the byte offset it was written at.
    fn push_raw<T>(&mut self, value: T) -> usize {
        let align = std::mem::align_of::<T>().max(1);
        let size = std::mem::size_of::<T>();
        let offset = align_to(self.cursor, align);
        let end = offset + size;

        if end > self.layout.size() || align > self.layout.align() {
            let new_align = self.layout.align().max(align);
            unsafe {
                let (new_storage, new_layout) = Self::grow(end, new_align, self.cursor, self.storage);
                if self.layout.size() != 0 {
                    dealloc(self.storage.as_ptr(), self.layout);
                }
                self.storage = new_storage;
                self.layout = new_layout;
            }
        }

        unsafe {
            ptr::write(self.storage.as_ptr().add(offset) as *mut T, value);
        }
        self.cursor = end;
        offset
    }

    fn record_component<T: Component>(&mut self, value: T) -> ComponentSlot {
        let descriptor = Arc::new(ComponentDescriptor::of::<T>());
        let offset = self.push_raw(value);
        ComponentSlot { descriptor, offset }
    }

    /// Queues the creation of a new, componentless entity and returns a
    /// temp id other commands in this buffer may attach components to.
    pub fn create_entity(&mut self) -> TempEntityId {
        let id = self.next_temp_id;
        self.next_temp_id += 1;
        self.entries.push(Entry::CreateEntity { temp_id: id });
        TempEntityId(id)
    }

    /// Queues the creation of a new entity that starts out as a copy of
    /// `source`'s current components.
    pub fn create_entity_from_entity(&mut self, source: EntityId) -> TempEntityId {
        let id = self.next_temp_id;
        self.next_temp_id += 1;
        self.entries.push(Entry::CreateEntityFromEntity { temp_id: id, source });
        TempEntityId(id)
    }

    pub fn despawn(&mut self, entity: EntityId) {
        self.entries.push(Entry::DeleteEntity(entity));
    }

    pub fn add_component<T: Component>(&mut self, entity: EntityId, value: T) {
        let component = self.record_component(value);
        self.entries.push(Entry::AddComponent {
            target: Target::Real(entity),
            component,
        });
    }

    pub fn add_component_to_temp<T: Component>(&mut self, temp: TempEntityId, value: T) {
        let component = self.record_component(value);
        self.entries.push(Entry::AddComponent {
            target: Target::Temp(temp.0),
            component,
        });
    }

    pub fn set_component<T: Component>(&mut self, entity: EntityId, value: T) {
        let component = self.record_component(value);
        self.entries.push(Entry::SetComponent {
            target: Target::Real(entity),
            component,
        });
    }

    pub fn set_component_for_temp<T: Component>(&mut self, temp: TempEntityId, value: T) {
        let component = self.record_component(value);
        self.entries.push(Entry::SetComponent {
            target: Target::Temp(temp.0),
            component,
        });
    }

    pub fn remove_component<T: Component>(&mut self, entity: EntityId) {
        self.entries.push(Entry::RemoveComponent {
            target: Target::Real(entity),
            type_id: TypeId::of::<T>(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops any component payloads still owned by the buffer and resets
    /// it for reuse, without applying anything to a world.
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            if let Entry::AddComponent { component, .. } | Entry::SetComponent { component, .. } = entry {
                if let Some(drop_fn) = component.descriptor.drop_fn {
                    unsafe { drop_fn(self.storage.as_ptr().add(component.offset)) };
                }
            }
        }
        self.cursor = 0;
        self.next_temp_id = 0;
    }

    /// Drops a queued-but-not-yet-transferred component payload. Called
    /// for a command that fails before its bytes are moved into the
    /// world, and for every command left unprocessed after the first
    /// failure — in both cases the bytes are still this buffer's
    /// responsibility, the same as in `clear()`.
    fn drop_payload(storage: NonNull<u8>, component: &ComponentSlot) {
        if let Some(drop_fn) = component.descriptor.drop_fn {
            unsafe { drop_fn(storage.as_ptr().add(component.offset)) };
        }
    }

    /// Replays every queued command against `world` in insertion order,
    /// then clears the buffer. Returns the first error encountered, if
    /// any. Regardless of outcome the buffer ends up empty: the failing
    /// command and everything queued after it are discarded (not
    /// reapplied on a later `commit()`), with any of their still-pending
    /// component payloads properly dropped rather than leaked.
    pub fn commit(&mut self, world: &mut World) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("command_buffer.commit", entries = self.entries.len());
        #[cfg(feature = "profiling")]
        let _guard = span.enter();

        let mut temp_map: Vec<Option<EntityId>> = vec![None; self.next_temp_id as usize];

        fn resolve(target: Target, temp_map: &[Option<EntityId>]) -> Result<EntityId> {
            match target {
                Target::Real(entity) => Ok(entity),
                Target::Temp(id) => temp_map
                    .get(id as usize)
                    .copied()
                    .flatten()
                    .ok_or(EcsError::EntityNotFound),
            }
        }

        let storage = self.storage;
        let mut entries = self.entries.drain(..);
        let mut result = Ok(());

        for entry in entries.by_ref() {
            let outcome = match entry {
                Entry::CreateEntity { temp_id } => {
                    let entity = world.spawn_empty();
                    temp_map[temp_id as usize] = Some(entity);
                    Ok(())
                }
                Entry::CreateEntityFromEntity { temp_id, source } => world.clone_entity(source).map(|entity| {
                    temp_map[temp_id as usize] = Some(entity);
                }),
                Entry::DeleteEntity(entity) => world.despawn(entity),
                Entry::AddComponent { target, component } => {
                    let outcome = resolve(target, &temp_map).and_then(|entity| unsafe {
                        world.add_component_raw(entity, component.descriptor.clone(), storage.as_ptr().add(component.offset))
                    });
                    if outcome.is_err() {
                        Self::drop_payload(storage, &component);
                    }
                    outcome
                }
                Entry::SetComponent { target, component } => {
                    let outcome = resolve(target, &temp_map).and_then(|entity| unsafe {
                        world.set_component_raw(entity, component.descriptor.clone(), storage.as_ptr().add(component.offset))
                    });
                    if outcome.is_err() {
                        Self::drop_payload(storage, &component);
                    }
                    outcome
                }
                Entry::RemoveComponent { target, type_id } => {
                    resolve(target, &temp_map).and_then(|entity| world.remove_component_by_type(entity, type_id))
                }
            };

            if let Err(e) = outcome {
                result = Err(e);
                break;
            }
        }

        // Anything left in `entries` was queued after the command that
        // failed; it never ran, so its component payloads (if any) are
        // still this buffer's to drop.
        for entry in entries {
            if let Entry::AddComponent { component, .. } | Entry::SetComponent { component, .. } = entry {
                Self::drop_payload(storage, &component);
            }
        }

        self.cursor = 0;
        self.next_temp_id = 0;
        result
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.clear();
        if self.layout.size() != 0 {
            unsafe { dealloc(self.storage.as_ptr(), self.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn starts_empty() {
        let buffer = CommandBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn queuing_commands_grows_the_buffer() {
        let mut buffer = CommandBuffer::new();
        let entity = EntityId::default();
        buffer.despawn(entity);
        buffer.add_component(entity, 7u32);
        buffer.remove_component::<u32>(entity);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn clear_drops_pending_component_payloads() {
        static DROPS: AtomicU32 = AtomicU32::new(0);
        struct CountsDrops;
        impl Drop for CountsDrops {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut buffer = CommandBuffer::new();
        buffer.add_component(EntityId::default(), CountsDrops);
        buffer.clear();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn temp_entity_ids_are_dense_and_ordered() {
        let mut buffer = CommandBuffer::new();
        let a = buffer.create_entity();
        let b = buffer.create_entity();
        assert_ne!(a, b);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn commit_drops_payloads_for_a_failing_command_and_everything_queued_after_it() {
        static DROPS: AtomicU32 = AtomicU32::new(0);
        struct CountsDrops;
        impl Drop for CountsDrops {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut world = World::new();
        let valid_entity = world.spawn_empty();
        let invalid_entity = EntityId::default();

        let mut buffer = CommandBuffer::new();
        // Fails immediately: `invalid_entity` was never spawned.
        buffer.add_component(invalid_entity, CountsDrops);
        // Never runs: queued after the failing command.
        buffer.add_component(valid_entity, CountsDrops);

        let result = buffer.commit(&mut world);
        assert!(result.is_err());
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
        assert!(buffer.is_empty());
        assert!(!world.has::<CountsDrops>(valid_entity));
    }
}
