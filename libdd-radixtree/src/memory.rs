// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where a tree's nodes and leaves live.

use crate::context::{
    Allocator, BumpAllocator, CountingAllocator, SlabAllocator, BUMP_DEFAULT_BLOCK_SIZE,
};
use crate::node::{class_info_of, size_classes, ChildPtr, SizeClass, NUM_SIZE_CLASSES, SLOT_SIZE};
use crate::value::TreeValue;
use crate::RadixTreeError;
use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;
use libdd_dsa::{DsaArea, DsaPointer};

mod sealed {
    pub trait Sealed {}
}

/// Backing store of a radix tree. Implemented by [`LocalMemory`] and
/// [`SharedMemory`] only.
pub trait NodeMemory: sealed::Sealed {
    /// Whether child pointers are arena pointers, valid in every process
    /// attached to the area.
    const SHARED: bool;

    fn allocate_node(&self, class: SizeClass) -> Result<ChildPtr, RadixTreeError>;

    /// # Safety
    /// `node` must come from [`NodeMemory::allocate_node`] with the same
    /// class and must not be used afterwards.
    unsafe fn free_node(&self, class: SizeClass, node: ChildPtr) -> Result<(), RadixTreeError>;

    fn allocate_leaf(&self, size: usize) -> Result<ChildPtr, RadixTreeError>;

    /// # Safety
    /// `leaf` must come from [`NodeMemory::allocate_leaf`] with the same size
    /// and must not be used afterwards.
    unsafe fn free_leaf(&self, leaf: ChildPtr, size: usize) -> Result<(), RadixTreeError>;

    /// Local address of a node or leaf.
    fn resolve(&self, ptr: ChildPtr) -> Result<NonNull<u8>, RadixTreeError>;

    /// Bytes reserved on behalf of the tree.
    fn memory_usage(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

enum LeafContext {
    Slab(SlabAllocator),
    Counting(CountingAllocator),
    Bump(BumpAllocator),
}

impl LeafContext {
    fn allocator(&self) -> &dyn Allocator {
        match self {
            LeafContext::Slab(slab) => slab,
            LeafContext::Counting(counting) => counting,
            LeafContext::Bump(bump) => bump,
        }
    }

    fn reserved_bytes(&self) -> usize {
        match self {
            LeafContext::Slab(slab) => slab.reserved_bytes(),
            LeafContext::Counting(counting) => counting.reserved_bytes(),
            LeafContext::Bump(bump) => bump.reserved_bytes(),
        }
    }
}

/// Process-local memory: one slab per node size class, and a leaf context
/// chosen by the value type.
pub struct LocalMemory {
    node_slabs: [SlabAllocator; NUM_SIZE_CLASSES],
    leaves: LeafContext,
    /// Makes node allocations report out of memory.
    #[cfg(test)]
    pub(crate) fail_node_allocs: core::sync::atomic::AtomicBool,
}

impl LocalMemory {
    pub(crate) fn new<V: TreeValue>(insert_only: bool) -> Result<Self, RadixTreeError> {
        let slab = |class: SizeClass| {
            let allocsize = class_info_of(class, false).allocsize;
            SlabAllocator::new(allocsize).map_err(|_| RadixTreeError::OutOfMemory {
                requested: allocsize,
            })
        };
        let node_slabs = [
            slab(SizeClass::Node4)?,
            slab(SizeClass::Node16Lo)?,
            slab(SizeClass::Node16Hi)?,
            slab(SizeClass::Node48)?,
            slab(SizeClass::Node256)?,
        ];
        let leaves = if insert_only {
            LeafContext::Bump(BumpAllocator::new(BUMP_DEFAULT_BLOCK_SIZE))
        } else if !V::VARIABLE_LENGTH && size_of::<V>() > SLOT_SIZE {
            LeafContext::Slab(SlabAllocator::new(size_of::<V>()).map_err(|_| {
                RadixTreeError::OutOfMemory {
                    requested: size_of::<V>(),
                }
            })?)
        } else {
            LeafContext::Counting(CountingAllocator::new())
        };
        Ok(LocalMemory {
            node_slabs,
            leaves,
            #[cfg(test)]
            fail_node_allocs: core::sync::atomic::AtomicBool::new(false),
        })
    }

    fn layout(size: usize) -> Result<Layout, RadixTreeError> {
        Layout::from_size_align(size, SLOT_SIZE)
            .map_err(|_| RadixTreeError::OutOfMemory { requested: size })
    }

    fn allocate_in(allocator: &dyn Allocator, size: usize) -> Result<ChildPtr, RadixTreeError> {
        let ptr = allocator
            .allocate(Self::layout(size)?)
            .map_err(|_| RadixTreeError::OutOfMemory { requested: size })?;
        Ok(ptr.cast::<u8>().as_ptr() as ChildPtr)
    }

    unsafe fn free_in(
        allocator: &dyn Allocator,
        ptr: ChildPtr,
        size: usize,
    ) -> Result<(), RadixTreeError> {
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| RadixTreeError::Corrupted("freeing a null pointer".into()))?;
        allocator.deallocate(ptr, Self::layout(size)?);
        Ok(())
    }
}

impl sealed::Sealed for LocalMemory {}

impl NodeMemory for LocalMemory {
    const SHARED: bool = false;

    fn allocate_node(&self, class: SizeClass) -> Result<ChildPtr, RadixTreeError> {
        let size = class_info_of(class, false).allocsize;
        #[cfg(test)]
        if self.fail_node_allocs.load(core::sync::atomic::Ordering::Relaxed) {
            return Err(RadixTreeError::OutOfMemory { requested: size });
        }
        Self::allocate_in(&self.node_slabs[class as usize], size)
    }

    unsafe fn free_node(&self, class: SizeClass, node: ChildPtr) -> Result<(), RadixTreeError> {
        let size = class_info_of(class, false).allocsize;
        Self::free_in(&self.node_slabs[class as usize], node, size)
    }

    fn allocate_leaf(&self, size: usize) -> Result<ChildPtr, RadixTreeError> {
        Self::allocate_in(self.leaves.allocator(), size)
    }

    unsafe fn free_leaf(&self, leaf: ChildPtr, size: usize) -> Result<(), RadixTreeError> {
        Self::free_in(self.leaves.allocator(), leaf, size)
    }

    fn resolve(&self, ptr: ChildPtr) -> Result<NonNull<u8>, RadixTreeError> {
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| RadixTreeError::Corrupted("null child pointer".into()))
    }

    fn memory_usage(&self) -> usize {
        let nodes: usize = self.node_slabs.iter().map(SlabAllocator::reserved_bytes).sum();
        nodes + self.leaves.reserved_bytes()
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Memory in a [`DsaArea`]. Node sizes are picked to match the area's size
/// classes.
pub struct SharedMemory<'a> {
    area: &'a DsaArea,
}

impl<'a> SharedMemory<'a> {
    pub(crate) fn new(area: &'a DsaArea) -> Self {
        SharedMemory { area }
    }

    pub fn area(&self) -> &'a DsaArea {
        self.area
    }
}

impl sealed::Sealed for SharedMemory<'_> {}

impl NodeMemory for SharedMemory<'_> {
    const SHARED: bool = true;

    fn allocate_node(&self, class: SizeClass) -> Result<ChildPtr, RadixTreeError> {
        let size = size_classes(true)[class as usize].allocsize;
        Ok(self.area.allocate(size)?.as_raw())
    }

    unsafe fn free_node(&self, _class: SizeClass, node: ChildPtr) -> Result<(), RadixTreeError> {
        Ok(self.area.free(DsaPointer::from_raw(node))?)
    }

    fn allocate_leaf(&self, size: usize) -> Result<ChildPtr, RadixTreeError> {
        Ok(self.area.allocate(size)?.as_raw())
    }

    unsafe fn free_leaf(&self, leaf: ChildPtr, _size: usize) -> Result<(), RadixTreeError> {
        Ok(self.area.free(DsaPointer::from_raw(leaf))?)
    }

    fn resolve(&self, ptr: ChildPtr) -> Result<NonNull<u8>, RadixTreeError> {
        let address = self.area.get_address(DsaPointer::from_raw(ptr))?;
        NonNull::new(address)
            .ok_or_else(|| RadixTreeError::Corrupted(format!("unresolvable child pointer {ptr:#x}")))
    }

    fn memory_usage(&self) -> usize {
        self.area.total_size()
    }
}
