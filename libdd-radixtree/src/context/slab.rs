// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::{slice_from_raw_parts_mut, NonNull};

pub const SLAB_DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Alignment of every chunk handed out by a [SlabAllocator].
pub const SLAB_CHUNK_ALIGN: usize = 8;

/// [SlabAllocator] hands out chunks of a single size. Chunks are carved
/// from blocks requested from the underlying allocator on demand, and freed
/// chunks go on a free list to be handed out again before any new block is
/// touched. Blocks are returned to the underlying allocator when the
/// [SlabAllocator] is dropped.
///
/// Requests larger than the chunk size, or more strictly aligned than
/// [SLAB_CHUNK_ALIGN], fail.
pub struct SlabAllocator<A: Allocator = Global> {
    chunk_size: usize,
    block_layout: Layout,
    state: UnsafeCell<SlabState>,
    allocator: A,
}

struct SlabState {
    blocks: Vec<NonNull<u8>>,
    free_list: Option<NonNull<FreeChunk>>,
    /// Offset of the first never-used chunk in the newest block.
    unused_offset: usize,
    chunks_in_use: usize,
}

/// Written over the first bytes of a chunk while it is free.
struct FreeChunk {
    next: Option<NonNull<FreeChunk>>,
}

unsafe impl<A: Allocator + Send> Send for SlabAllocator<A> {}

impl SlabAllocator<Global> {
    pub fn new(chunk_size: usize) -> Result<Self, AllocError> {
        Self::new_in(chunk_size, Global)
    }
}

impl<A: Allocator> SlabAllocator<A> {
    /// Size of the blocks used for `chunk_size` chunks: big enough for at
    /// least 32 of them.
    pub const fn block_size_for(chunk_size: usize) -> usize {
        let wanted = (chunk_size * 32).next_power_of_two();
        if wanted > SLAB_DEFAULT_BLOCK_SIZE {
            wanted
        } else {
            SLAB_DEFAULT_BLOCK_SIZE
        }
    }

    pub fn new_in(chunk_size: usize, allocator: A) -> Result<Self, AllocError> {
        let chunk_size = chunk_size
            .max(size_of::<FreeChunk>())
            .checked_next_multiple_of(SLAB_CHUNK_ALIGN)
            .ok_or(AllocError)?;
        let block_layout =
            Layout::from_size_align(Self::block_size_for(chunk_size), SLAB_CHUNK_ALIGN)
                .map_err(|_| AllocError)?;
        Ok(Self {
            chunk_size,
            block_layout,
            state: UnsafeCell::new(SlabState {
                blocks: Vec::new(),
                free_list: None,
                unused_offset: 0,
                chunks_in_use: 0,
            }),
            allocator,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn block_size(&self) -> usize {
        self.block_layout.size()
    }

    /// Get the number of bytes in chunks currently handed out.
    pub fn used_bytes(&self) -> usize {
        // SAFETY: references to the state never escape a method.
        unsafe { (*self.state.get()).chunks_in_use * self.chunk_size }
    }

    /// Get the number of bytes allocated by the underlying allocator.
    pub fn reserved_bytes(&self) -> usize {
        // SAFETY: references to the state never escape a method.
        unsafe { (*self.state.get()).blocks.len() * self.block_layout.size() }
    }

    #[cold]
    #[inline(never)]
    fn grow(&self, state: &mut SlabState) -> Result<(), AllocError> {
        let block = self.allocator.allocate(self.block_layout)?;
        state.blocks.push(block.cast());
        state.unused_offset = 0;
        Ok(())
    }
}

unsafe impl<A: Allocator> Allocator for SlabAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 || layout.size() > self.chunk_size || layout.align() > SLAB_CHUNK_ALIGN
        {
            return Err(AllocError);
        }
        // SAFETY: the state is only touched inside methods of this type, and
        // the type is not Sync.
        let state = unsafe { &mut *self.state.get() };

        let chunk = if let Some(free) = state.free_list {
            // SAFETY: chunks on the free list hold a FreeChunk.
            state.free_list = unsafe { free.as_ref().next };
            free.cast::<u8>()
        } else {
            if state.blocks.is_empty()
                || state.unused_offset + self.chunk_size > self.block_layout.size()
            {
                self.grow(state)?;
            }
            let block = state.blocks.last().copied().ok_or(AllocError)?;
            // SAFETY: the chunk lies inside the newest block, as checked above.
            let chunk = unsafe { NonNull::new_unchecked(block.as_ptr().add(state.unused_offset)) };
            state.unused_offset += self.chunk_size;
            chunk
        };
        state.chunks_in_use += 1;

        let wide_ptr = slice_from_raw_parts_mut(chunk.as_ptr(), self.chunk_size);
        // SAFETY: derived from a non-null chunk pointer.
        Ok(unsafe { NonNull::new_unchecked(wide_ptr) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let state = &mut *self.state.get();
        let chunk = ptr.cast::<FreeChunk>();
        chunk.as_ptr().write(FreeChunk {
            next: state.free_list,
        });
        state.free_list = Some(chunk);
        state.chunks_in_use -= 1;
    }
}

impl<A: Allocator> Drop for SlabAllocator<A> {
    fn drop(&mut self) {
        let layout = self.block_layout;
        for block in self.state.get_mut().blocks.drain(..) {
            // SAFETY: every block came from this allocator with this layout.
            unsafe { self.allocator.deallocate(block, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes() {
        assert_eq!(SlabAllocator::<Global>::block_size_for(40), SLAB_DEFAULT_BLOCK_SIZE);
        assert_eq!(SlabAllocator::<Global>::block_size_for(2088), 128 * 1024);
    }

    #[test]
    fn reuses_freed_chunks() {
        let slab = SlabAllocator::new(40).unwrap();
        let layout = Layout::from_size_align(40, 8).unwrap();
        let a = slab.allocate(layout).unwrap();
        let b = slab.allocate(layout).unwrap();
        assert_ne!(a.cast::<u8>(), b.cast::<u8>());
        assert_eq!(slab.used_bytes(), 80);
        assert_eq!(slab.reserved_bytes(), SLAB_DEFAULT_BLOCK_SIZE);

        unsafe { slab.deallocate(a.cast(), layout) };
        let c = slab.allocate(layout).unwrap();
        assert_eq!(a.cast::<u8>(), c.cast::<u8>());
        assert_eq!(slab.used_bytes(), 80);
    }

    #[test]
    fn grows_by_whole_blocks() {
        let slab = SlabAllocator::new(1000).unwrap();
        let per_block = slab.block_size() / slab.chunk_size();
        let layout = Layout::from_size_align(1000, 8).unwrap();
        let chunks: Vec<_> = (0..per_block + 1)
            .map(|i| {
                let mut p = slab.allocate(layout).unwrap();
                unsafe { p.as_mut().fill(i as u8) };
                p
            })
            .collect();
        assert_eq!(slab.reserved_bytes(), 2 * slab.block_size());
        for (i, p) in chunks.iter().enumerate() {
            assert!(unsafe { p.as_ref() }.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn rejects_what_does_not_fit() {
        let slab = SlabAllocator::new(16).unwrap();
        assert!(slab.allocate(Layout::from_size_align(17, 8).unwrap()).is_err());
        assert!(slab.allocate(Layout::from_size_align(8, 16).unwrap()).is_err());
        assert!(slab.allocate(Layout::from_size_align(0, 1).unwrap()).is_err());
        assert_eq!(slab.reserved_bytes(), 0);
    }
}
