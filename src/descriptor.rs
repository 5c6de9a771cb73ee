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

//! Component descriptors: type-erased layout and lifecycle function
//! pointers, cached once per component type and shared by every archetype
//! and chunk that stores the type.
//!
//! This plays the role a vtable plays in a C++ ECS: instead of a trait
//! object per component we keep a small table of raw function pointers
//! (drop/move/eq) alongside the `Layout`, looked up by `TypeId`. Storing
//! one `Arc<ComponentDescriptor>` per `World` avoids a process-global
//! registry, so multiple `World`s never contend over it.

use std::any::TypeId;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::component::Component;

/// Move `size` bytes from `src` to `dst` and forget the source, i.e. a
/// typed `ptr::copy_nonoverlapping` without dropping either end.
pub type MoveFn = unsafe fn(src: *mut u8, dst: *mut u8);
/// Drop the value at `ptr` in place. `None` when `T` has no `Drop` impl.
pub type DropFn = unsafe fn(ptr: *mut u8);
/// Byte-for-byte structural equality, used only for unique-component
/// chunk merging.
pub type EqFn = unsafe fn(a: *const u8, b: *const u8) -> bool;

/// Layout and lifecycle operations for one component type, resolved once
/// and shared by every chunk that stores it.
pub struct ComponentDescriptor {
    pub type_id: TypeId,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    pub move_fn: MoveFn,
    pub drop_fn: Option<DropFn>,
    pub eq_fn: Option<EqFn>,
}

impl ComponentDescriptor {
    /// Builds a descriptor for `T` without going through a cache. Used by
    /// the command buffer, which records components before it has access
    /// to a `World`'s cache and reconciles with it at `commit()` time.
    pub(crate) fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>().max(1),
            move_fn: move_impl::<T>,
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_impl::<T>)
            } else {
                None
            },
            eq_fn: None,
        }
    }

    fn of_unique<T: Component + PartialEq>() -> Self {
        Self {
            eq_fn: Some(eq_impl::<T>),
            ..Self::of::<T>()
        }
    }
}

unsafe fn move_impl<T>(src: *mut u8, dst: *mut u8) {
    std::ptr::copy_nonoverlapping(src as *const T, dst as *mut T, 1);
}

unsafe fn drop_impl<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn eq_impl<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
    *(a as *const T) == *(b as *const T)
}

/// Per-`World` cache mapping a component's `TypeId` to its descriptor.
///
/// Descriptors are immutable once created, so they're handed out as
/// `Arc` clones rather than references — chunks and archetypes hold onto
/// their own copy for as long as they live, with no borrow tied to the
/// cache itself.
#[derive(Default)]
pub struct ComponentDescriptorCache {
    map: FxHashMap<TypeId, Arc<ComponentDescriptor>>,
}

impl ComponentDescriptorCache {
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }

    pub fn get_or_register<T: Component>(&mut self) -> Arc<ComponentDescriptor> {
        self.map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(ComponentDescriptor::of::<T>()))
            .clone()
    }

    /// Registers (or upgrades) a descriptor with an equality function so
    /// unique-component chunks can be compared for merge eligibility.
    pub fn get_or_register_unique<T: Component + PartialEq>(&mut self) -> Arc<ComponentDescriptor> {
        let entry = self.map.entry(TypeId::of::<T>());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) if o.get().eq_fn.is_none() => {
                o.insert(Arc::new(ComponentDescriptor::of_unique::<T>()));
                o.into_mut().clone()
            }
            std::collections::hash_map::Entry::Occupied(o) => o.get().clone(),
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Arc::new(ComponentDescriptor::of_unique::<T>())).clone()
            }
        }
    }

    pub fn get(&self, type_id: TypeId) -> Option<Arc<ComponentDescriptor>> {
        self.map.get(&type_id).cloned()
    }

    /// Reconciles an externally-built descriptor (e.g. one the command
    /// buffer built before a `World` existed) with this cache: if a
    /// descriptor for the same type is already cached, that one wins.
    pub fn get_or_insert(&mut self, descriptor: Arc<ComponentDescriptor>) -> Arc<ComponentDescriptor> {
        self.map
            .entry(descriptor.type_id)
            .or_insert(descriptor)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(PartialEq)]
    struct Tag(u32);

    #[test]
    fn caches_by_type_id() {
        let mut cache = ComponentDescriptorCache::new();
        let a = cache.get_or_register::<Tag>();
        let b = cache.get_or_register::<Tag>();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.size, std::mem::size_of::<Tag>());
    }

    #[test]
    fn unique_registration_adds_eq_fn() {
        let mut cache = ComponentDescriptorCache::new();
        let d = cache.get_or_register_unique::<Tag>();
        assert!(d.eq_fn.is_some());
        let looked_up = cache.get(TypeId::of::<Tag>()).unwrap();
        assert!(looked_up.eq_fn.is_some());
    }
}
