// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The leader, the per-database worker and on-demand dumps.
//!
//! The leader loads the dump file once, when it first starts against a
//! shared state, then dumps the pool every interval and once more when
//! cancelled. Loading hands the sorted records to one per-database worker
//! at a time; each worker runs on its own thread with its own `Dsm`
//! session, attaching to the shared state and to the segment holding the
//! records the way a separate process would.

use crate::config::PrewarmConfig;
use crate::dump_file;
use crate::pool::BufferPool;
use crate::record::{BlockInfoRecord, BlockNumber, Oid, INVALID_OID, MAX_FORKNUM};
use crate::state::PrewarmState;
use anyhow::Context;
use core::mem::size_of;
use libdd_dsm::{Dsm, DsmHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Who asked for a dump. A background dump skips quietly when the dump file
/// is busy; a requested one fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpRequester {
    Background,
    User,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Records in the dump file.
    pub total: usize,
    pub prewarmed: u64,
    /// Loading stopped early because of cancellation.
    pub interrupted: bool,
    /// Another participant was using the dump file.
    pub skipped: bool,
}

/// Releases the dump file claim when dropped.
struct DumpFileClaim<'s>(&'s PrewarmState);

impl Drop for DumpFileClaim<'_> {
    fn drop(&mut self) {
        self.0.release_dump_file();
    }
}

/// Clears the leader registration when dropped.
struct LeaderRegistration<'s>(&'s PrewarmState);

impl Drop for LeaderRegistration<'_> {
    fn drop(&mut self) {
        self.0.unregister_leader();
    }
}

pub struct AutoPrewarm<'p, P: BufferPool> {
    dsm: Dsm,
    state: PrewarmState,
    pool: &'p P,
    config: PrewarmConfig,
    cancel: CancellationToken,
}

impl<'p, P: BufferPool> AutoPrewarm<'p, P> {
    pub fn new(
        dsm: Dsm,
        state: PrewarmState,
        pool: &'p P,
        config: PrewarmConfig,
        cancel: CancellationToken,
    ) -> Self {
        AutoPrewarm {
            dsm,
            state,
            pool,
            config,
            cancel,
        }
    }

    pub fn state(&self) -> &PrewarmState {
        &self.state
    }

    pub fn config(&self) -> &PrewarmConfig {
        &self.config
    }

    /// Runs the leader until cancelled. Returns at once if another leader
    /// is running.
    pub async fn run(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.config.enabled, "autoprewarm is disabled");
        if let Err(pid) = self.state.register_leader() {
            tracing::info!(pid, "autoprewarm worker is already running");
            return Ok(());
        }
        let _registration = LeaderRegistration(&self.state);

        let mut final_dump_allowed = true;
        let mut last_dump = Instant::now();
        // A later leader would load a dump file it may already have
        // overwritten.
        if self.state.first_load_attempt() {
            let stats = self.load_buffers()?;
            // Dumping now would save only what was loaded so far.
            final_dump_allowed = !stats.interrupted;
            last_dump = Instant::now();
        }

        while !self.cancel.is_cancelled() {
            if self.config.interval.is_zero() {
                self.cancel.cancelled().await;
                break;
            }
            let next_dump = last_dump + self.config.interval;
            if Instant::now() >= next_dump {
                last_dump = Instant::now();
                self.dump_now(DumpRequester::Background, false)?;
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(next_dump) => {}
            }
        }

        if final_dump_allowed {
            // Most likely a shutdown, so unlogged blocks are worth keeping.
            self.dump_now(DumpRequester::Background, true)?;
        }
        Ok(())
    }

    /// Writes the blocks in the pool to the dump file. Unlogged blocks are
    /// only included with `dump_unlogged`. Returns the number of blocks.
    pub fn dump_now(&self, requester: DumpRequester, dump_unlogged: bool) -> anyhow::Result<usize> {
        if let Err(pid) = self.state.claim_dump_file() {
            anyhow::ensure!(
                requester == DumpRequester::Background,
                "could not perform block dump because dump file is being used by PID {pid}"
            );
            tracing::warn!(pid, "skipping block dump because it is already being performed");
            return Ok(0);
        }
        let _claim = DumpFileClaim(&self.state);

        let mut records = Vec::new();
        for tag in self.pool.buffer_tags() {
            anyhow::ensure!(!self.cancel.is_cancelled(), "block dump cancelled");
            if tag.permanent || dump_unlogged {
                records.push(tag.block);
            }
        }
        dump_file::write(
            &self.config.dump_file,
            &self.config.transient_dump_file(),
            &records,
        )?;
        tracing::debug!(blocks = records.len(), "wrote block details");
        Ok(records.len())
    }

    /// Reads the dump file and prewarms its blocks, one database at a
    /// time.
    pub fn load_buffers(&self) -> anyhow::Result<LoadStats> {
        if let Err(pid) = self.state.claim_dump_file() {
            tracing::warn!(pid, "skipping prewarm because block dump file is being written");
            return Ok(LoadStats {
                skipped: true,
                ..LoadStats::default()
            });
        }
        let _claim = DumpFileClaim(&self.state);

        let Some(mut records) = dump_file::read(&self.config.dump_file)? else {
            return Ok(LoadStats::default());
        };
        if records.is_empty() {
            return Ok(LoadStats::default());
        }
        records.sort_unstable();

        let segment = self
            .dsm
            .create(records.len() * size_of::<BlockInfoRecord>())
            .context("could not create segment for autoprewarm block info")?;
        // SAFETY: the segment was sized for the records and is suitably
        // aligned; workers only read it once the handle is published.
        unsafe {
            core::ptr::copy_nonoverlapping(
                records.as_ptr(),
                segment.address().cast::<BlockInfoRecord>().as_ptr(),
                records.len(),
            );
        }
        self.state.start_load(segment.handle());

        let mut interrupted = false;
        let mut start = 0;
        while let Some((database, stop)) = next_batch(&records, start) {
            self.state.set_batch(database, start, stop);
            if !self.pool.have_free_buffer() {
                break;
            }
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            self.run_database_worker();
            start = stop;
        }
        interrupted |= self.cancel.is_cancelled();

        drop(segment);
        self.state.finish_load();

        let stats = LoadStats {
            total: records.len(),
            prewarmed: self.state.prewarmed_blocks(),
            interrupted,
            skipped: false,
        };
        if !interrupted {
            tracing::info!(
                prewarmed = stats.prewarmed,
                total = stats.total,
                "autoprewarm successfully prewarmed previously-loaded blocks"
            );
        }
        Ok(stats)
    }

    /// Runs the worker for the current batch and waits for it. A failed
    /// worker only loses its own batch.
    fn run_database_worker(&self) {
        let config = self.dsm.config().clone();
        let handle = self.state.handle();
        let pool = self.pool;
        let cancel = &self.cancel;
        let outcome = std::thread::scope(|scope| {
            scope
                .spawn(move || -> anyhow::Result<u64> {
                    let dsm = Dsm::new(config).context("could not open a worker session")?;
                    database_worker(&dsm, handle, pool, cancel)
                })
                .join()
        });
        match outcome {
            Ok(Ok(prewarmed)) => tracing::debug!(prewarmed, "autoprewarm worker finished"),
            Ok(Err(err)) => tracing::warn!(%err, "autoprewarm worker failed"),
            Err(_) => tracing::warn!("autoprewarm worker panicked"),
        }
    }
}

/// The database of the batch starting at `start`, and where the batch ends.
/// Global objects join the batch of the database following them; when no
/// database follows there is nothing to connect to and they are dropped.
fn next_batch(records: &[BlockInfoRecord], start: usize) -> Option<(Oid, usize)> {
    let mut current = records.get(start)?.database;
    let mut stop = start + 1;
    while let Some(record) = records.get(stop) {
        if record.database != current {
            if current != INVALID_OID {
                break;
            }
            current = record.database;
        }
        stop += 1;
    }
    (current != INVALID_OID).then_some((current, stop))
}

/// Prewarms the batch currently published in the shared state. Returns the
/// number of blocks read.
pub fn database_worker<P: BufferPool>(
    dsm: &Dsm,
    state_handle: DsmHandle,
    pool: &P,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let state = PrewarmState::attach(dsm, state_handle)?;
    let batch = state.batch();
    anyhow::ensure!(
        batch.block_info_handle.is_valid(),
        "no autoprewarm batch is being loaded"
    );
    let segment = dsm
        .attach(batch.block_info_handle)
        .context("could not map dynamic shared memory segment")?;
    let capacity = segment.size() / size_of::<BlockInfoRecord>();
    anyhow::ensure!(
        batch.start <= batch.stop && batch.stop <= capacity,
        "autoprewarm batch {}..{} is out of bounds",
        batch.start,
        batch.stop
    );
    // SAFETY: the leader filled the segment before publishing the batch and
    // does not change it while workers run.
    let records = unsafe {
        core::slice::from_raw_parts(
            segment.address().cast::<BlockInfoRecord>().as_ptr(),
            batch.stop,
        )
    };
    pool.connect(batch.database)
        .with_context(|| format!("could not connect to database {}", batch.database))?;

    let mut prewarmed = 0;
    let mut relation = None;
    let mut nblocks: BlockNumber = 0;
    let mut previous: Option<&BlockInfoRecord> = None;
    for block in &records[batch.start..batch.stop] {
        if !pool.have_free_buffer() || cancel.is_cancelled() {
            break;
        }
        if let Some(old) = previous {
            // Global objects share the batch of the database after them.
            if old.database != block.database && !old.is_global() {
                break;
            }
        }

        let (new_relation, new_fork) = match previous {
            None => (true, true),
            Some(old) => {
                let new_relation = old.filenumber != block.filenumber;
                (new_relation, new_relation || old.forknum != block.forknum)
            }
        };
        previous = Some(block);
        if new_relation {
            // A dropped relation stays `None` until the next one.
            relation = pool.relation_for(block.tablespace, block.filenumber);
        }
        let Some(rel) = &relation else {
            continue;
        };

        if new_fork {
            nblocks = if block.forknum <= MAX_FORKNUM && pool.fork_exists(rel, block.forknum) {
                pool.fork_nblocks(rel, block.forknum)
            } else {
                0
            };
        }
        if block.blocknum >= nblocks {
            continue;
        }
        if pool.read_buffer(rel, block.forknum, block.blocknum) {
            state.add_prewarmed_block();
            prewarmed += 1;
        }
    }
    Ok(prewarmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(databases: &[Oid]) -> Vec<BlockInfoRecord> {
        databases
            .iter()
            .map(|&database| BlockInfoRecord {
                database,
                ..BlockInfoRecord::default()
            })
            .collect()
    }

    fn batches(databases: &[Oid]) -> Vec<(Oid, usize, usize)> {
        let records = records(databases);
        let mut start = 0;
        let mut out = Vec::new();
        while let Some((database, stop)) = next_batch(&records, start) {
            out.push((database, start, stop));
            start = stop;
        }
        out
    }

    #[test]
    fn one_batch_per_database() {
        assert_eq!(batches(&[5, 5, 7, 9, 9]), vec![(5, 0, 2), (7, 2, 3), (9, 3, 5)]);
        assert_eq!(batches(&[]), vec![]);
    }

    #[test]
    fn globals_join_the_next_database() {
        assert_eq!(batches(&[0, 0, 5, 7]), vec![(5, 0, 3), (7, 3, 4)]);
    }

    #[test]
    fn lone_globals_are_dropped() {
        assert_eq!(batches(&[0, 0]), vec![]);
    }

    struct EmptyPool;

    impl BufferPool for EmptyPool {
        type Relation = ();

        fn buffer_tags(&self) -> Vec<crate::BufferTag> {
            Vec::new()
        }

        fn have_free_buffer(&self) -> bool {
            true
        }

        fn relation_for(&self, _: Oid, _: u32) -> Option<()> {
            None
        }

        fn fork_exists(&self, _: &(), _: crate::ForkNumber) -> bool {
            false
        }

        fn fork_nblocks(&self, _: &(), _: crate::ForkNumber) -> BlockNumber {
            0
        }

        fn read_buffer(&self, _: &(), _: crate::ForkNumber, _: BlockNumber) -> bool {
            false
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn busy_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = libdd_dsm::DsmConfig::new(libdd_dsm::DsmImpl::Anonymous, dir.path());
        let dsm = Dsm::new(config.clone()).unwrap();
        let other_dsm = Dsm::new(config).unwrap();
        let state = PrewarmState::create(&dsm).unwrap();
        let other = PrewarmState::attach(&other_dsm, state.handle())
            .unwrap()
            .with_pid(4242);
        let prewarm = AutoPrewarm::new(
            dsm,
            state,
            &EmptyPool,
            PrewarmConfig::new(dir.path()),
            CancellationToken::new(),
        );

        other.claim_dump_file().unwrap();
        let err = prewarm.dump_now(DumpRequester::User, false).unwrap_err();
        assert!(err.to_string().contains("PID 4242"), "{err}");
        assert_eq!(prewarm.dump_now(DumpRequester::Background, false).unwrap(), 0);
        assert!(prewarm.load_buffers().unwrap().skipped);
        assert!(!prewarm.config().dump_file.exists());
        assert_eq!(prewarm.state().pid_using_dump_file(), Some(4242));

        drop(other);
        assert_eq!(prewarm.dump_now(DumpRequester::User, false).unwrap(), 0);
        assert!(prewarm.config().dump_file.exists());
    }
}
