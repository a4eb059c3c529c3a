// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic shared memory segments.
//!
//! A segment is an OS-backed extent of memory identified by a 32-bit
//! [`DsmHandle`]. Any process (or any [`Dsm`] session inside one process) can
//! attach to a segment by handle; each attachment maps the extent at its own
//! base address, so data structures placed inside a segment must only ever
//! store offsets, never raw pointers.
//!
//! Three backing implementations are provided, selected by [`DsmImpl`]:
//!
//! - [`DsmImpl::Posix`]: `shm_open` objects named after the handle.
//! - [`DsmImpl::Mmap`]: regular files under the data directory, mapped shared.
//! - [`DsmImpl::Anonymous`]: anonymous memory (`memfd` on Linux) registered in a process-wide
//!   table; attachments from the same process map the same pages at a new address.
//!
//! Every extent starts with a small header recording the installation that
//! created it (device and inode of the data directory), a reference count and
//! a pinned flag. The usable part of the extent begins after that header.
//!
//! The crate also provides [`LwLock`], a reader/writer lock whose whole state
//! is a single atomic word, suitable for placement inside shared memory.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
mod error;
mod lwlock;
mod mem_handle;
mod segment;

pub use config::{DsmConfig, DsmImpl};
pub use error::DsmError;
pub use lwlock::{LwLock, LwLockGuard, LwLockMode};
pub use segment::{DetachCallbackId, Dsm, DsmHandle, PinnedMapping, Segment, SEGMENT_HEADER_SIZE};
