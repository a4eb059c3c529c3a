// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sets of tuple identifiers.
//!
//! A tuple is identified by the block it lives in and its offset within
//! that block ([`ItemPointer`]). Two set representations are provided:
//!
//! - [`TidStore`] keeps every identifier exactly, per block, in a radix
//!   tree. It can live in a DSA area and be shared between processes.
//! - [`TidBitmap`] keeps identifiers exactly while it fits in its memory
//!   budget and degrades whole pages to "maybe" when it does not. It
//!   supports union and intersection, and its iteration can be shared
//!   between processes.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod error;
mod tid;
mod tidbitmap;
mod tidstore;

pub use error::TidBitmapError;
pub use tid::{
    BlockNumber, ItemPointer, OffsetNumber, BLCKSZ, INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER,
    MAX_HEAP_TUPLES_PER_PAGE, MAX_OFFSET_NUMBER,
};
pub use tidbitmap::{
    calculate_entries, free_shared_area, TbmIterateResult, TbmIterator, TbmSharedIterator,
    TidBitmap, PAGES_PER_CHUNK,
};
pub use tidstore::{
    BlocktableEntry, TidStore, TidStoreHandle, TidStoreIter, TidStoreIterResult, TidStoreReader,
    TidStoreWriter, NUM_FULL_OFFSETS,
};
