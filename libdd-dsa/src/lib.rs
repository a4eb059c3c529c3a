// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic shared memory areas.
//!
//! This crate builds a general purpose allocator on top of the segments of
//! [`libdd_dsm`]:
//!
//! - [`FreePageManager`] tracks the free pages of one contiguous extent and
//!   hands out runs of them. It keeps all of its state inside the extent.
//! - [`DsaArea`] spreads a heap over as many segments as it needs, creating
//!   them as it grows and giving them back once they are empty. Memory is
//!   named by [`DsaPointer`]s, which every attached process can resolve.
//!
//! Structures stored in shared memory refer to each other through
//! [`DsaPointer`] (across segments) or [`RelPtr`] (inside one extent), never
//! through raw addresses.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod area;
mod error;
pub mod freepage;
mod pointer;
mod size_class;

pub use area::{
    minimum_size, AllocFlags, DsaArea, DsaConfig, DsaHandle, DEFAULT_INIT_SEGMENT_SIZE,
    DEFAULT_MAX_SEGMENT_SIZE, MAX_ALLOC_SIZE, MAX_HUGE_ALLOC_SIZE,
};
pub use error::DsaError;
pub use freepage::{FreePageManager, FPM_PAGE_SIZE};
pub use pointer::{DsaPointer, RelPtr, DSA_MAX_SEGMENTS, DSA_MAX_SEGMENT_SIZE, DSA_OFFSET_WIDTH};
pub use size_class::{allocation_size, MAX_SMALL_OBJECT_SIZE};
