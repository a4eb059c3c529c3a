// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::record::{BlockInfoRecord, BlockNumber, ForkNumber, Oid};

/// A buffer's identity as seen when scanning the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTag {
    pub block: BlockInfoRecord,
    /// Unlogged relations are not permanent: they are emptied after a crash,
    /// so their blocks are only dumped at a clean shutdown.
    pub permanent: bool,
}

/// What the host's buffer pool offers to the prewarmer.
pub trait BufferPool: Sync {
    /// An open relation, kept while consecutive blocks belong to it.
    type Relation;

    /// Tags of every valid buffer, in pool order.
    fn buffer_tags(&self) -> Vec<BufferTag>;

    /// Whether a block can still be read without evicting another.
    fn have_free_buffer(&self) -> bool;

    /// Connects the calling worker to `database`. Global objects are
    /// reachable from every database.
    fn connect(&self, _database: Oid) -> anyhow::Result<()> {
        Ok(())
    }

    /// Opens the relation stored in `filenumber`, or `None` if it has been
    /// dropped since the dump.
    fn relation_for(&self, tablespace: Oid, filenumber: u32) -> Option<Self::Relation>;

    fn fork_exists(&self, relation: &Self::Relation, fork: ForkNumber) -> bool;

    fn fork_nblocks(&self, relation: &Self::Relation, fork: ForkNumber) -> BlockNumber;

    /// Reads a block into the pool. Returns whether a buffer was loaded.
    fn read_buffer(&self, relation: &Self::Relation, fork: ForkNumber, block: BlockNumber) -> bool;
}
