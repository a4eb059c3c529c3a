// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object size classes of the arena.
//!
//! The sizes are picked so that objects of every class pack into a
//! [`SUPERBLOCK_SIZE`] superblock with little waste. Two classes are special:
//! class 0 holds span descriptors (its superblocks are a single page that
//! describes itself) and class 1 has no objects at all, its spans wrap the
//! page runs of large allocations.

use crate::area::Span;
use crate::freepage::FPM_PAGE_SIZE;
use core::mem::size_of;

pub(crate) const SCLASS_BLOCK_OF_SPANS: usize = 0;
pub(crate) const SCLASS_SPAN_LARGE: usize = 1;

pub(crate) const PAGES_PER_SUPERBLOCK: usize = 16;
pub(crate) const SUPERBLOCK_SIZE: usize = PAGES_PER_SUPERBLOCK * FPM_PAGE_SIZE;

pub(crate) const SIZE_CLASSES: [u16; 38] = [
    size_of::<Span>() as u16,
    0,
    8,
    16,
    24,
    32,
    40,
    48,
    56,
    64,
    80,
    96,
    112,
    128,
    160,
    192,
    224,
    256,
    320,
    384,
    448,
    512,
    640,
    768,
    896,
    1024,
    1280,
    1560,
    1816,
    2048,
    2616,
    3120,
    3640,
    4096,
    5456,
    6552,
    7280,
    8192,
];

pub(crate) const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Largest request served from a pool; anything bigger gets its own pages.
pub const MAX_SMALL_OBJECT_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1] as usize;

const SIZE_CLASS_MAP_QUANTUM: usize = 8;

/// Size class for every request below 1 KiB, indexed by
/// `ceil(size / 8) - 1`.
#[rustfmt::skip]
const SIZE_CLASS_MAP: [u8; 128] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 10, 11, 11, 12, 12, 13, 13,
    14, 14, 14, 14, 15, 15, 15, 15, 16, 16, 16, 16, 17, 17, 17, 17,
    18, 18, 18, 18, 18, 18, 18, 18, 19, 19, 19, 19, 19, 19, 19, 19,
    20, 20, 20, 20, 20, 20, 20, 20, 21, 21, 21, 21, 21, 21, 21, 21,
    22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22,
    23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23,
    24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24,
    25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25,
];

const _: () = assert!(size_of::<Span>() <= 64);
const _: () = assert!(SUPERBLOCK_SIZE / 8 < u16::MAX as usize);

/// Smallest class whose objects hold `size` bytes. `size` must be in
/// `1..=MAX_SMALL_OBJECT_SIZE`.
pub(crate) fn size_to_class(size: usize) -> usize {
    debug_assert!(size > 0 && size <= MAX_SMALL_OBJECT_SIZE);
    if size < SIZE_CLASS_MAP.len() * SIZE_CLASS_MAP_QUANTUM {
        let index = size.div_ceil(SIZE_CLASS_MAP_QUANTUM) - 1;
        return SIZE_CLASS_MAP[index] as usize;
    }
    let mut min = SIZE_CLASS_MAP[SIZE_CLASS_MAP.len() - 1] as usize;
    let mut max = NUM_SIZE_CLASSES - 1;
    while min < max {
        let mid = (min + max) / 2;
        if (SIZE_CLASSES[mid] as usize) < size {
            min = mid + 1;
        } else {
            max = mid;
        }
    }
    min
}

pub(crate) fn class_size(size_class: usize) -> usize {
    SIZE_CLASSES[size_class] as usize
}

/// Objects a fresh superblock of `size_class` can hand out.
pub(crate) fn objects_per_superblock(size_class: usize) -> usize {
    if size_class == SCLASS_BLOCK_OF_SPANS {
        // The first slot is the block's own descriptor.
        FPM_PAGE_SIZE / class_size(size_class) - 1
    } else {
        SUPERBLOCK_SIZE / class_size(size_class)
    }
}

/// Size the arena actually reserves for a request of `size` bytes. Useful
/// to callers that want their objects to fill a class exactly.
pub fn allocation_size(size: usize) -> usize {
    if size == 0 {
        0
    } else if size > MAX_SMALL_OBJECT_SIZE {
        size.div_ceil(FPM_PAGE_SIZE) * FPM_PAGE_SIZE
    } else {
        class_size(size_to_class(size))
    }
}
