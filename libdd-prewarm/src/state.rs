// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! State shared by the leader, the per-database workers and anyone asking
//! for a dump, kept in its own dynamic shared memory segment.

use anyhow::Context;
use core::cell::Cell;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use libdd_dsm::{Dsm, DsmHandle, LwLock, Segment};

use crate::record::{Oid, INVALID_OID};

const PREWARM_STATE_MAGIC: u32 = 0x6170_7721;

/// Lock tranche of the shared state.
pub const PREWARM_TRANCHE_ID: u32 = 0x6170;

/// Process ids are never zero.
const INVALID_PID: u32 = 0;

/// What the leader hands to a per-database worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Batch {
    pub block_info_handle: DsmHandle,
    pub database: Oid,
    pub start: usize,
    pub stop: usize,
}

#[derive(Debug)]
#[repr(C)]
struct Fields {
    leader_pid: u32,
    pid_using_dump_file: u32,
    block_info_handle: DsmHandle,
    database: Oid,
    start: usize,
    stop: usize,
    /// The first leader has tried to load the dump file.
    load_attempted: bool,
}

#[repr(C)]
struct SharedState {
    magic: u32,
    lock: LwLock,
    prewarmed_blocks: AtomicU64,
    fields: Fields,
}

/// One participant's attachment to the shared state. Dropping it clears the
/// leader and dump file claims this participant holds.
pub struct PrewarmState {
    segment: Segment,
    pid: u32,
    is_leader: Cell<bool>,
    holds_dump_file: Cell<bool>,
}

impl PrewarmState {
    pub fn create(dsm: &Dsm) -> anyhow::Result<Self> {
        let segment = dsm
            .create(size_of::<SharedState>())
            .context("could not create autoprewarm shared state")?;
        let state = segment.address().cast::<SharedState>();
        // SAFETY: freshly created and large enough; nobody else knows the
        // handle yet.
        unsafe {
            state.as_ptr().write(SharedState {
                magic: PREWARM_STATE_MAGIC,
                lock: LwLock::new(PREWARM_TRANCHE_ID),
                prewarmed_blocks: AtomicU64::new(0),
                fields: Fields {
                    leader_pid: INVALID_PID,
                    pid_using_dump_file: INVALID_PID,
                    block_info_handle: DsmHandle::INVALID,
                    database: INVALID_OID,
                    start: 0,
                    stop: 0,
                    load_attempted: false,
                },
            });
        }
        tracing::debug!(handle = %segment.handle(), "created autoprewarm shared state");
        Ok(Self::new(segment))
    }

    pub fn attach(dsm: &Dsm, handle: DsmHandle) -> anyhow::Result<Self> {
        let segment = dsm
            .attach(handle)
            .with_context(|| format!("could not attach autoprewarm shared state {handle}"))?;
        anyhow::ensure!(
            segment.size() >= size_of::<SharedState>(),
            "segment {handle} is too small for autoprewarm shared state"
        );
        // SAFETY: large enough; the magic is written once at creation.
        let magic = unsafe { (*segment.address().cast::<SharedState>().as_ptr()).magic };
        anyhow::ensure!(
            magic == PREWARM_STATE_MAGIC,
            "segment {handle} does not hold autoprewarm shared state"
        );
        Ok(Self::new(segment))
    }

    fn new(segment: Segment) -> Self {
        PrewarmState {
            segment,
            pid: std::process::id(),
            is_leader: Cell::new(false),
            holds_dump_file: Cell::new(false),
        }
    }

    /// Identifies this participant in the shared state. Defaults to the
    /// process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn handle(&self) -> DsmHandle {
        self.segment.handle()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn ptr(&self) -> NonNull<SharedState> {
        self.segment.address().cast()
    }

    fn lock(&self) -> &LwLock {
        // SAFETY: the segment stays mapped while `self` lives; the lock is
        // only used through shared references.
        unsafe { &*ptr::addr_of!((*self.ptr().as_ptr()).lock) }
    }

    fn with_fields<R>(&self, f: impl FnOnce(&mut Fields) -> R) -> R {
        let _guard = self.lock().write();
        // SAFETY: the fields are only touched while holding the lock.
        let fields = unsafe { &mut *ptr::addr_of_mut!((*self.ptr().as_ptr()).fields) };
        f(fields)
    }

    fn prewarmed(&self) -> &AtomicU64 {
        // SAFETY: as for the lock.
        unsafe { &*ptr::addr_of!((*self.ptr().as_ptr()).prewarmed_blocks) }
    }

    pub fn leader_pid(&self) -> Option<u32> {
        self.with_fields(|fields| valid_pid(fields.leader_pid))
    }

    pub fn pid_using_dump_file(&self) -> Option<u32> {
        self.with_fields(|fields| valid_pid(fields.pid_using_dump_file))
    }

    /// Blocks read by per-database workers during the current or last load.
    pub fn prewarmed_blocks(&self) -> u64 {
        self.prewarmed().load(Ordering::Relaxed)
    }

    pub(crate) fn add_prewarmed_block(&self) {
        self.prewarmed().fetch_add(1, Ordering::Relaxed);
    }

    /// Becomes the leader, or reports the pid of the running one.
    pub(crate) fn register_leader(&self) -> Result<(), u32> {
        self.with_fields(|fields| match valid_pid(fields.leader_pid) {
            Some(pid) => Err(pid),
            None => {
                fields.leader_pid = self.pid;
                self.is_leader.set(true);
                Ok(())
            }
        })
    }

    pub(crate) fn unregister_leader(&self) {
        if self.is_leader.replace(false) {
            self.with_fields(|fields| {
                if fields.leader_pid == self.pid {
                    fields.leader_pid = INVALID_PID;
                }
            });
        }
    }

    /// Returns true only the first time it is called on this shared state.
    pub(crate) fn first_load_attempt(&self) -> bool {
        self.with_fields(|fields| !core::mem::replace(&mut fields.load_attempted, true))
    }

    /// Claims the dump file, or reports the pid using it.
    pub(crate) fn claim_dump_file(&self) -> Result<(), u32> {
        self.with_fields(|fields| match valid_pid(fields.pid_using_dump_file) {
            Some(pid) => Err(pid),
            None => {
                fields.pid_using_dump_file = self.pid;
                self.holds_dump_file.set(true);
                Ok(())
            }
        })
    }

    pub(crate) fn release_dump_file(&self) {
        if self.holds_dump_file.replace(false) {
            self.with_fields(|fields| {
                if fields.pid_using_dump_file == self.pid {
                    fields.pid_using_dump_file = INVALID_PID;
                }
            });
        }
    }

    pub(crate) fn start_load(&self, block_info_handle: DsmHandle) {
        self.with_fields(|fields| {
            fields.block_info_handle = block_info_handle;
            fields.start = 0;
            fields.stop = 0;
        });
        self.prewarmed().store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_batch(&self, database: Oid, start: usize, stop: usize) {
        self.with_fields(|fields| {
            fields.database = database;
            fields.start = start;
            fields.stop = stop;
        });
    }

    pub(crate) fn finish_load(&self) {
        self.with_fields(|fields| fields.block_info_handle = DsmHandle::INVALID);
    }

    pub fn batch(&self) -> Batch {
        self.with_fields(|fields| Batch {
            block_info_handle: fields.block_info_handle,
            database: fields.database,
            start: fields.start,
            stop: fields.stop,
        })
    }
}

fn valid_pid(pid: u32) -> Option<u32> {
    (pid != INVALID_PID).then_some(pid)
}

impl Drop for PrewarmState {
    fn drop(&mut self) {
        self.release_dump_file();
        self.unregister_leader();
    }
}

impl core::fmt::Debug for PrewarmState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrewarmState")
            .field("handle", &self.handle())
            .field("pid", &self.pid)
            .field("is_leader", &self.is_leader.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_dsm::{DsmConfig, DsmImpl};

    fn sessions(dir: &tempfile::TempDir) -> (Dsm, Dsm) {
        let config = DsmConfig::new(DsmImpl::Anonymous, dir.path());
        (Dsm::new(config.clone()).unwrap(), Dsm::new(config).unwrap())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn dump_file_is_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = sessions(&dir);
        let first = PrewarmState::create(&a).unwrap().with_pid(100);
        let second = PrewarmState::attach(&b, first.handle()).unwrap().with_pid(200);

        first.claim_dump_file().unwrap();
        assert_eq!(second.claim_dump_file(), Err(100));
        assert_eq!(second.pid_using_dump_file(), Some(100));
        // Only the holder can release the claim.
        second.release_dump_file();
        assert_eq!(first.pid_using_dump_file(), Some(100));
        first.release_dump_file();
        second.claim_dump_file().unwrap();
        // Detaching gives up the claim.
        drop(second);
        assert_eq!(first.pid_using_dump_file(), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn one_leader_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = sessions(&dir);
        let first = PrewarmState::create(&a).unwrap().with_pid(100);
        let second = PrewarmState::attach(&b, first.handle()).unwrap().with_pid(200);
        first.register_leader().unwrap();
        assert_eq!(second.register_leader(), Err(100));
        first.unregister_leader();
        second.register_leader().unwrap();
        assert_eq!(first.leader_pid(), Some(200));

        assert!(first.first_load_attempt());
        assert!(!second.first_load_attempt());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn batches_are_visible_to_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = sessions(&dir);
        let leader = PrewarmState::create(&a).unwrap();
        let worker = PrewarmState::attach(&b, leader.handle()).unwrap();
        leader.start_load(DsmHandle::from_u32(7));
        leader.set_batch(5, 2, 9);
        assert_eq!(
            worker.batch(),
            Batch {
                block_info_handle: DsmHandle::from_u32(7),
                database: 5,
                start: 2,
                stop: 9,
            }
        );
        worker.add_prewarmed_block();
        assert_eq!(leader.prewarmed_blocks(), 1);
        leader.finish_load();
        assert!(!worker.batch().block_info_handle.is_valid());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn attach_checks_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = sessions(&dir);
        let other = a.create(size_of::<SharedState>()).unwrap();
        assert!(PrewarmState::attach(&b, other.handle()).is_err());
    }
}
