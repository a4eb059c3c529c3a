// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keeps a buffer pool warm across restarts.
//!
//! A leader periodically writes the identity of every block in the host's
//! buffer pool to a plain text dump file. After a restart it reads the file
//! back, sorts the blocks and has per-database workers read them into the
//! pool again, stopping as soon as the pool runs out of free buffers.
//!
//! Participants coordinate through [`PrewarmState`], which lives in a
//! dynamic shared memory segment. The host plugs in through
//! [`BufferPool`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dump_file;
mod pool;
mod record;
mod state;
mod worker;

pub use config::PrewarmConfig;
pub use pool::{BufferPool, BufferTag};
pub use record::{
    BlockInfoRecord, BlockNumber, ForkNumber, Oid, FSM_FORKNUM, INIT_FORKNUM, INVALID_OID,
    MAIN_FORKNUM, MAX_FORKNUM, VISIBILITYMAP_FORKNUM,
};
pub use state::{Batch, PrewarmState, PREWARM_TRANCHE_ID};
pub use worker::{database_worker, AutoPrewarm, DumpRequester, LoadStats};
