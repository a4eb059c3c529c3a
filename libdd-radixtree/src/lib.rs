// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive radix trees keyed by `u64`.
//!
//! A key is consumed eight bits per level, most significant first, and the
//! tree is only as tall as its largest key needs. Inner nodes come in four
//! kinds that trade space for lookup speed:
//!
//! - node4 and node16 keep sorted chunk and child arrays,
//! - node48 maps each chunk to one of its child slots,
//! - node256 indexes its children by chunk directly.
//!
//! Node16 has two size classes, so a node grows through five sizes on its
//! way from 4 to 256 children and shrinks back as keys are deleted.
//!
//! Values implement [`TreeValue`]. Small ones are stored in the child slot
//! itself; the rest get a leaf allocation.
//!
//! [`RadixTree`] lives in process memory. [`SharedRadixTree`] lives in a
//! [`libdd_dsa::DsaArea`] and is reached by every process attached to it,
//! under a single reader/writer lock.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod context;
mod error;
mod iter;
mod memory;
mod node;
mod shared;
mod tree;
mod value;

pub use error::RadixTreeError;
pub use iter::Iter;
pub use memory::{LocalMemory, NodeMemory, SharedMemory};
pub use node::{ChildPtr, NodeKind, SizeClass, SizeClassInfo, NUM_SIZE_CLASSES};
pub use shared::{LockedIter, SharedRadixTree, TreeReadGuard, TreeWriteGuard};
pub use tree::{RadixTree, RadixTreeHandle, RadixTreeStats};
pub use value::TreeValue;

/// Size classes used by trees in process memory, or in a DSA area when
/// `shared` is set.
pub fn size_classes(shared: bool) -> &'static [SizeClassInfo; NUM_SIZE_CLASSES] {
    node::size_classes(shared)
}
