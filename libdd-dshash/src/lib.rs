// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent hash table stored in a dynamic shared memory area.
//!
//! Entries are fixed-size byte records whose leading `key_size` bytes form
//! the key. Lookups lock one of 128 partitions and hand back a
//! [`DshashEntry`] that keeps the lock until it is dropped. The table grows
//! online by doubling its bucket array when a partition gets too full.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod error;
mod hash;
mod table;

pub use error::DshashError;
pub use hash::{memcmp, memhash, strcmp, strhash};
pub use table::{
    CompareFunction, DsHash, DshashEntry, DshashHandle, DshashParameters, HashFunction, SeqScan,
    DSHASH_NUM_PARTITIONS, DSHASH_NUM_PARTITIONS_LOG2,
};
