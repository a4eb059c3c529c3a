// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr::{slice_from_raw_parts_mut, NonNull};

pub const BUMP_DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// [BumpAllocator] is an arena allocator, meaning that deallocating
/// individual allocations made by this allocator does nothing. Instead, the
/// whole backing memory is dropped at once.
///
/// Allocations are carved off the newest block; when it runs out, a new
/// block is requested from the underlying allocator and the leftover space
/// at the end of the previous one is never used again. This suits data that
/// is only ever added to.
pub struct BumpAllocator<A: Allocator = Global> {
    /// The size hint for each block.
    block_size: usize,
    state: UnsafeCell<BumpState>,
    allocator: A,
}

struct BumpState {
    blocks: Vec<(NonNull<u8>, Layout)>,
    /// Bytes handed out (alignment padding included) from the newest block.
    top_used: usize,
    /// Bytes handed out from every block but the newest.
    prev_used: usize,
}

unsafe impl<A: Allocator + Send> Send for BumpAllocator<A> {}

impl BumpAllocator<Global> {
    pub const fn new(block_size: usize) -> Self {
        Self::new_in(block_size, Global)
    }
}

impl<A: Allocator> BumpAllocator<A> {
    pub const fn new_in(block_size: usize, allocator: A) -> Self {
        Self {
            block_size,
            state: UnsafeCell::new(BumpState {
                blocks: Vec::new(),
                top_used: 0,
                prev_used: 0,
            }),
            allocator,
        }
    }

    /// Get the number of bytes handed out, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        // SAFETY: references to the state never escape a method.
        let state = unsafe { &*self.state.get() };
        state.prev_used + state.top_used
    }

    /// Get the number of bytes allocated by the underlying allocator. This
    /// number is greater than or equal to [Self::used_bytes].
    pub fn reserved_bytes(&self) -> usize {
        // SAFETY: references to the state never escape a method.
        let state = unsafe { &*self.state.get() };
        state.blocks.iter().map(|(_, layout)| layout.size()).sum()
    }

    #[cold]
    #[inline(never)]
    fn grow(&self, state: &mut BumpState, layout: Layout) -> Result<(), AllocError> {
        let size = layout.size().max(self.block_size);
        let align = layout.align().max(core::mem::align_of::<u64>());
        let block_layout = Layout::from_size_align(size, align).map_err(|_| AllocError)?;
        let block = self.allocator.allocate(block_layout)?;
        state.blocks.push((block.cast(), block_layout));
        state.prev_used += state.top_used;
        state.top_used = 0;
        Ok(())
    }
}

unsafe impl<A: Allocator> Allocator for BumpAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        // SAFETY: the state is only touched inside methods of this type, and
        // the type is not Sync.
        let state = unsafe { &mut *self.state.get() };

        let fits = |state: &BumpState| -> Option<usize> {
            let (base, block_layout) = state.blocks.last()?;
            let start = base.as_ptr() as usize + state.top_used;
            let padding = start.wrapping_neg() & (layout.align() - 1);
            let needed = padding.checked_add(layout.size())?;
            (state.top_used + needed <= block_layout.size()).then_some(padding)
        };

        let padding = match fits(state) {
            Some(padding) => padding,
            None => {
                self.grow(state, layout)?;
                fits(state).ok_or(AllocError)?
            }
        };
        let (base, _) = state.blocks.last().copied().ok_or(AllocError)?;
        // SAFETY: `fits` checked that the allocation lies inside the block.
        let thin_ptr = unsafe { base.as_ptr().add(state.top_used + padding) };
        state.top_used += padding + layout.size();

        let wide_ptr = slice_from_raw_parts_mut(thin_ptr, layout.size());
        // SAFETY: derived from the block pointer, so it is not null.
        Ok(unsafe { NonNull::new_unchecked(wide_ptr) })
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // This is an arena. It does batch de-allocation when dropped.
    }
}

impl<A: Allocator> Drop for BumpAllocator<A> {
    fn drop(&mut self) {
        for (block, layout) in self.state.get_mut().blocks.drain(..) {
            // SAFETY: every block came from this allocator with this layout.
            unsafe { self.allocator.deallocate(block, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basics() {
        let allocator = BumpAllocator::new(4096);
        let layout = Layout::new::<[u8; 8]>();
        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(allocator.used_bytes(), 8);
        assert_eq!(allocator.reserved_bytes(), 4096);

        // deallocate doesn't return memory to the allocator, but it shouldn't
        // panic.
        unsafe { allocator.deallocate(ptr.cast(), layout) };
        assert_eq!(allocator.used_bytes(), 8);
    }

    #[test]
    fn test_alignment_and_growth() {
        let allocator = BumpAllocator::new(64);
        let byte = allocator.allocate(Layout::new::<u8>()).unwrap();
        let word = allocator.allocate(Layout::new::<u64>()).unwrap();
        assert_eq!(word.cast::<u8>().as_ptr() as usize % 8, 0);
        assert_eq!(
            word.cast::<u8>().as_ptr() as usize - byte.cast::<u8>().as_ptr() as usize,
            8
        );
        assert_eq!(allocator.used_bytes(), 16);

        // Bigger than a block: gets a block of its own.
        let big = allocator.allocate(Layout::array::<u8>(200).unwrap()).unwrap();
        assert!(big.len() >= 200);
        assert_eq!(allocator.reserved_bytes(), 64 + 200);
    }

    #[test]
    fn fuzz() {
        bolero::check!()
            .with_type::<Vec<(u16, u8)>>()
            .for_each(|requests| {
                let allocator = BumpAllocator::new(1024);
                let mut handed_out = Vec::new();
                for &(size, align_bits) in requests {
                    let align = 1usize << (align_bits % 7);
                    let Ok(layout) = Layout::from_size_align(size as usize + 1, align) else {
                        continue;
                    };
                    let mut ptr = allocator.allocate(layout).unwrap();
                    assert_eq!(ptr.cast::<u8>().as_ptr() as usize % align, 0);
                    unsafe { ptr.as_mut().fill(align_bits) };
                    handed_out.push((ptr, align_bits));
                }
                for (ptr, val) in handed_out {
                    assert!(unsafe { ptr.as_ref() }.iter().all(|&b| b == val));
                }
                assert!(allocator.used_bytes() <= allocator.reserved_bytes());
            });
    }
}
