// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tuple identifiers and the page geometry they are bounded by.

use core::fmt;

pub type BlockNumber = u32;
pub type OffsetNumber = u16;

pub const INVALID_BLOCK_NUMBER: BlockNumber = BlockNumber::MAX;
pub const INVALID_OFFSET_NUMBER: OffsetNumber = 0;

/// Size of a heap page.
pub const BLCKSZ: usize = 8192;

const PAGE_HEADER_SIZE: usize = 24;
const ITEM_ID_SIZE: usize = 4;
/// Heap tuple header, rounded up to 8 bytes.
const HEAP_TUPLE_HEADER_SIZE: usize = 24;

/// Largest offset a line pointer can have on a page.
pub const MAX_OFFSET_NUMBER: OffsetNumber = (BLCKSZ / ITEM_ID_SIZE) as OffsetNumber;

/// Most tuples a heap page can hold, all of them empty.
pub const MAX_HEAP_TUPLES_PER_PAGE: usize =
    (BLCKSZ - PAGE_HEADER_SIZE) / (HEAP_TUPLE_HEADER_SIZE + ITEM_ID_SIZE);

pub(crate) type Bitmapword = u64;
pub(crate) const BITS_PER_BITMAPWORD: usize = Bitmapword::BITS as usize;

pub(crate) const fn wordnum(x: usize) -> usize {
    x / BITS_PER_BITMAPWORD
}

pub(crate) const fn bitnum(x: usize) -> usize {
    x % BITS_PER_BITMAPWORD
}

/// A tuple's block and line pointer offset. Offsets start at 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    pub const fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        ItemPointer { block, offset }
    }

    pub const fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK_NUMBER && self.offset != INVALID_OFFSET_NUMBER
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}
