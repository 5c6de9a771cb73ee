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

//! Component and Bundle traits.
//!
//! Components are data attached to entities. Bundles group multiple
//! components together for a single `spawn` call.

use std::any::TypeId;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::descriptor::{ComponentDescriptor, ComponentDescriptorCache};

/// Maximum number of components a single `Bundle` tuple impl supports.
/// This bounds only the tuple macro below, not how many components an
/// entity may carry in total (an entity accumulates components across
/// many `add_component`/`set_unique` calls too).
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components. Components must be `'static` (no
/// borrowed data) and `Send + Sync` so a `World` can be moved or shared
/// across threads between (not during) mutations.
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

/// A group of components spawned onto one entity at once.
pub trait Bundle: Send + Sync + 'static {
    /// Type ids of every component in the bundle, in the same order
    /// `write_components` expects its pointers.
    fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Resolves (registering if necessary) a descriptor for each
    /// component, in `type_ids()` order.
    fn descriptors(
        cache: &mut ComponentDescriptorCache,
    ) -> SmallVec<[Arc<ComponentDescriptor>; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Writes each component to its destination pointer and forgets
    /// `self`, moving ownership into archetype storage.
    ///
    /// # Safety
    /// `ptrs` must contain one validly-aligned, writable pointer per
    /// component in `type_ids()` order.
    unsafe fn write_components(self, ptrs: &[*mut u8]);
}

// Bundle is deliberately not blanket-implemented for `T: Component` —
// that would collide with the tuple impls below.

macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(TypeId::of::<$T>()),*]
            }

            fn descriptors(
                cache: &mut ComponentDescriptorCache,
            ) -> SmallVec<[Arc<ComponentDescriptor>; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(cache.get_or_register::<$T>()),*]
            }

            #[allow(non_snake_case)]
            unsafe fn write_components(self, ptrs: &[*mut u8]) {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    std::ptr::write(ptrs[i] as *mut $T, $T);
                    i += 1;
                )*
                let _ = i;
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    #![allow(dead_code)]
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy)]
    struct Velocity {
        x: f32,
    }

    #[test]
    fn single_component_bundle() {
        let type_ids = <(Position,)>::type_ids();
        assert_eq!(type_ids.len(), 1);
        assert_eq!(type_ids[0], TypeId::of::<Position>());
    }

    #[test]
    fn multi_component_bundle_preserves_order() {
        let type_ids = <(Position, Velocity)>::type_ids();
        assert_eq!(type_ids.len(), 2);
        assert_eq!(type_ids[0], TypeId::of::<Position>());
        assert_eq!(type_ids[1], TypeId::of::<Velocity>());
    }

    #[test]
    fn descriptors_match_type_ids() {
        let mut cache = ComponentDescriptorCache::new();
        let ids = <(Position, Velocity)>::type_ids();
        let descriptors = <(Position, Velocity)>::descriptors(&mut cache);
        for (id, d) in ids.iter().zip(descriptors.iter()) {
            assert_eq!(*id, d.type_id);
        }
    }
}
