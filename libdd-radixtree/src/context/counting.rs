// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::NonNull;

/// [CountingAllocator] forwards every request to the underlying allocator
/// and keeps a running total of the bytes currently allocated through it.
pub struct CountingAllocator<A: Allocator = Global> {
    allocated: Cell<usize>,
    allocator: A,
}

impl CountingAllocator<Global> {
    pub const fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for CountingAllocator<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> CountingAllocator<A> {
    pub const fn new_in(allocator: A) -> Self {
        Self {
            allocated: Cell::new(0),
            allocator,
        }
    }

    /// Get the number of bytes currently allocated.
    pub fn reserved_bytes(&self) -> usize {
        self.allocated.get()
    }
}

unsafe impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.allocator.allocate(layout)?;
        self.allocated.set(self.allocated.get() + layout.size());
        Ok(ptr)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.allocator.allocate_zeroed(layout)?;
        self.allocated.set(self.allocated.get() + layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.allocator.deallocate(ptr, layout);
        self.allocated.set(self.allocated.get() - layout.size());
    }
}
