// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allocators backing trees that live in process-local memory.
//!
//! Every node size class gets its own [`SlabAllocator`], so nodes of one
//! class are packed together and freed chunks are reused by the next node
//! of the same class. Leaf values come from a [`SlabAllocator`] when they
//! have a fixed size, from a [`CountingAllocator`] when their size varies,
//! or from a [`BumpAllocator`] when the tree is only ever inserted into.
//! All of them report the bytes they reserve, which is what
//! `memory_usage` adds up.

mod bump;
mod counting;
mod slab;

pub use bump::*;
pub use counting::*;
pub use slab::*;

pub use allocator_api2::alloc::{AllocError, Allocator, Global};
