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

//! Component registry, the `Component`/`Bundle` traits, and the type-erased
//! column storage (`RawColumn`) that archetypes are built from.

use std::any::TypeId;
use std::collections::HashMap;

use ahash::RandomState;
use smallvec::{smallvec, SmallVec};

use crate::error::{EcsError, Result};

/// Maximum number of components supported by `Bundle` implementations.
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components. Components must be `'static` (no borrowed data).
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

/// A stable small integer identifying a registered component kind.
/// Unlike `TypeId`, this is dense and suitable as an array/bitset index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComponentId(pub u32);

impl ComponentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a kind's column is physically addressed. Dense is the default for
/// ordinary inline value types; Sparse marks handle/reference-typed kinds
/// that a caller expects to be rare per archetype (carried as registry
/// metadata consumed by higher layers; the core's own column storage is
/// uniform regardless of class, see `DESIGN.md`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StorageClass {
    Dense,
    Sparse,
}

#[derive(Clone, Copy)]
struct DropGlue(unsafe fn(*mut u8));

impl std::fmt::Debug for DropGlue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DropGlue(..)")
    }
}

/// Metadata describing a registered component kind.
#[derive(Clone, Debug)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    pub storage: StorageClass,
    drop_fn: Option<DropGlue>,
}

impl ComponentInfo {
    fn matches_layout(&self, size: usize, align: usize) -> bool {
        self.size == size && self.align == align
    }

    /// Allocate a fresh, empty column suitable for storing rows of this kind.
    pub fn array_factory(&self) -> RawColumn {
        RawColumn::new(self.size, self.drop_fn.map(|g| g.0))
    }
}

unsafe fn drop_glue<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

/// Maps component kinds to stable ids and carries their layout/drop metadata.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentId, RandomState>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns the existing id if `T` was already registered with
    /// the same layout, assigns a fresh one otherwise. Fails if `T` was
    /// registered before under a conflicting layout (only possible if two
    /// distinct types happened to collide on `TypeId`, which cannot happen in
    /// practice, but the contract is asserted defensively).
    pub fn register<T: Component>(&mut self) -> Result<ComponentId> {
        self.register_with_storage::<T>(StorageClass::Dense)
    }

    pub fn register_sparse<T: Component>(&mut self) -> Result<ComponentId> {
        self.register_with_storage::<T>(StorageClass::Sparse)
    }

    fn register_with_storage<T: Component>(&mut self, storage: StorageClass) -> Result<ComponentId> {
        let type_id = TypeId::of::<T>();
        if let Some(&id) = self.by_type.get(&type_id) {
            let info = &self.infos[id.index()];
            return if info.matches_layout(std::mem::size_of::<T>(), std::mem::align_of::<T>()) {
                Ok(id)
            } else {
                Err(EcsError::KindAlreadyRegisteredWithDifferentLayout(
                    std::any::type_name::<T>(),
                ))
            };
        }

        let id = ComponentId(self.infos.len() as u32);
        let drop_fn = if std::mem::needs_drop::<T>() {
            Some(DropGlue(drop_glue::<T> as unsafe fn(*mut u8)))
        } else {
            None
        };
        self.infos.push(ComponentInfo {
            id,
            name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            storage,
            drop_fn,
        });
        self.by_type.insert(type_id, id);
        Ok(id)
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn describe(&self, id: ComponentId) -> &ComponentInfo {
        &self.infos[id.index()]
    }

    pub fn array_factory(&self, id: ComponentId) -> RawColumn {
        self.infos[id.index()].array_factory()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Type-erased, growable column of component values, addressed by row.
/// Rows `[0, len)` are always live and contiguous; removal is swap-remove.
pub struct RawColumn {
    stride: usize,
    drop_fn: Option<unsafe fn(*mut u8)>,
    data: Vec<u8>,
    len: usize,
}

impl std::fmt::Debug for RawColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawColumn")
            .field("stride", &self.stride)
            .field("len", &self.len)
            .finish()
    }
}

impl RawColumn {
    pub fn new(stride: usize, drop_fn: Option<unsafe fn(*mut u8)>) -> Self {
        Self {
            stride,
            drop_fn,
            data: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn ensure_capacity(&mut self, rows: usize) {
        if self.stride == 0 {
            return;
        }
        let needed = rows * self.stride;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    /// Reserve a new row at the tail and return a pointer the caller must
    /// initialize exactly once before the row is observed again.
    pub fn push_uninit(&mut self) -> *mut u8 {
        let row = self.len;
        self.ensure_capacity(row + 1);
        self.len += 1;
        unsafe { self.row_mut_ptr(row) }
    }

    /// # Safety
    /// `row` must be `< len`.
    pub unsafe fn row_ptr(&self, row: usize) -> *const u8 {
        if self.stride == 0 {
            std::ptr::NonNull::dangling().as_ptr()
        } else {
            self.data.as_ptr().add(row * self.stride)
        }
    }

    /// # Safety
    /// `row` must be `< len`.
    pub unsafe fn row_mut_ptr(&mut self, row: usize) -> *mut u8 {
        if self.stride == 0 {
            std::ptr::NonNull::dangling().as_ptr()
        } else {
            self.data.as_mut_ptr().add(row * self.stride)
        }
    }

    /// Swap-remove `row`, running the drop glue on the removed value first.
    /// Returns `true` if the former last row was moved into `row`'s slot
    /// (the caller must update that entity's record to point at the new row).
    ///
    /// # Safety
    /// `row` must be `< len`.
    pub unsafe fn swap_remove_drop(&mut self, row: usize) -> bool {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        if let Some(drop_fn) = self.drop_fn {
            drop_fn(self.row_mut_ptr(row));
        }
        let moved = row != last;
        if moved && self.stride > 0 {
            let ptr = self.data.as_mut_ptr();
            std::ptr::copy_nonoverlapping(ptr.add(last * self.stride), ptr.add(row * self.stride), self.stride);
        }
        self.len -= 1;
        moved
    }

    /// Swap-remove `row` without dropping the removed value, because the
    /// caller has already moved its bytes out (e.g. into another archetype's
    /// column during an archetype transition).
    ///
    /// # Safety
    /// `row` must be `< len`, and the caller must have already taken
    /// ownership of the bytes previously at `row`.
    pub unsafe fn swap_remove_no_drop(&mut self, row: usize) -> bool {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        let moved = row != last;
        if moved && self.stride > 0 {
            let ptr = self.data.as_mut_ptr();
            std::ptr::copy_nonoverlapping(ptr.add(last * self.stride), ptr.add(row * self.stride), self.stride);
        }
        self.len -= 1;
        moved
    }

    /// Number of rows the backing buffer currently has room for, independent
    /// of how many are live.
    pub fn allocated_rows(&self) -> usize {
        if self.stride == 0 {
            self.len
        } else {
            self.data.len() / self.stride
        }
    }

    /// Release backing capacity down to exactly `rows` rows. `rows` must be
    /// `>= len()`; shrinking below the live row count would truncate live data.
    pub fn shrink_to(&mut self, rows: usize) {
        if self.stride == 0 || rows < self.len {
            return;
        }
        self.data.truncate(rows * self.stride);
        self.data.shrink_to_fit();
    }

    /// Copy `stride` bytes from `src` into a freshly reserved row, without
    /// running the source's destructor (value-move semantics).
    ///
    /// # Safety
    /// `src` must point at `stride` readable, properly initialized bytes of
    /// the same component kind this column stores.
    pub unsafe fn push_copy_from(&mut self, src: *const u8) {
        let dst = self.push_uninit();
        if self.stride > 0 {
            std::ptr::copy_nonoverlapping(src, dst, self.stride);
        }
    }
}

impl Drop for RawColumn {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            for row in 0..self.len {
                unsafe { drop_fn(self.row_mut_ptr(row)) };
            }
        }
    }
}

/// Bundle of components, allowing an entity to be spawned with several
/// component values at once.
pub trait Bundle: Send + Sync + 'static {
    /// Type ids of every component in the bundle, in declaration order.
    fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Register every component kind in the bundle with the registry.
    fn register_components(registry: &mut ComponentRegistry) -> Result<SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]>>
    where
        Self: Sized;

    /// Write every component's bytes into the corresponding pointer.
    ///
    /// # Safety
    /// `ptrs` must contain one writable, correctly aligned pointer per
    /// component in declaration order, each pointing at storage sized for
    /// that component.
    unsafe fn write_components(self, ptrs: &[*mut u8]);
}

macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(TypeId::of::<$T>()),*]
            }

            fn register_components(registry: &mut ComponentRegistry) -> Result<SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]>> {
                let mut ids = SmallVec::new();
                $(ids.push(registry.register::<$T>()?);)*
                Ok(ids)
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
