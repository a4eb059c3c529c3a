// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use libdd_dsm::{Dsm, DsmConfig, DsmImpl};
use libdd_prewarm::{
    AutoPrewarm, BlockInfoRecord, BlockNumber, BufferPool, BufferTag, DumpRequester, ForkNumber,
    Oid, PrewarmConfig, PrewarmState, FSM_FORKNUM, MAIN_FORKNUM,
};
use tokio_util::sync::CancellationToken;

const TABLESPACE: Oid = 1663;

#[derive(Default)]
struct MockPool {
    tags: Vec<BufferTag>,
    /// Fork sizes per filenumber; missing filenumbers were dropped.
    relations: BTreeMap<u32, BTreeMap<ForkNumber, BlockNumber>>,
    free_buffers: AtomicUsize,
    scans: AtomicUsize,
    connects: Mutex<Vec<Oid>>,
    reads: Mutex<Vec<(u32, ForkNumber, BlockNumber)>>,
}

impl MockPool {
    fn with_free_buffers(free: usize) -> Self {
        MockPool {
            free_buffers: AtomicUsize::new(free),
            ..MockPool::default()
        }
    }

    fn relation(mut self, filenumber: u32, forks: &[(ForkNumber, BlockNumber)]) -> Self {
        self.relations.insert(filenumber, forks.iter().copied().collect());
        self
    }

    fn tag(mut self, block: BlockInfoRecord, permanent: bool) -> Self {
        self.tags.push(BufferTag { block, permanent });
        self
    }

    fn reads(&self) -> Vec<(u32, ForkNumber, BlockNumber)> {
        self.reads.lock().unwrap().clone()
    }

    fn connects(&self) -> Vec<Oid> {
        self.connects.lock().unwrap().clone()
    }
}

impl BufferPool for MockPool {
    type Relation = u32;

    fn buffer_tags(&self) -> Vec<BufferTag> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.tags.clone()
    }

    fn have_free_buffer(&self) -> bool {
        self.free_buffers.load(Ordering::Relaxed) > 0
    }

    fn connect(&self, database: Oid) -> anyhow::Result<()> {
        self.connects.lock().unwrap().push(database);
        Ok(())
    }

    fn relation_for(&self, tablespace: Oid, filenumber: u32) -> Option<u32> {
        assert_eq!(tablespace, TABLESPACE);
        self.relations.contains_key(&filenumber).then_some(filenumber)
    }

    fn fork_exists(&self, relation: &u32, fork: ForkNumber) -> bool {
        self.relations[relation].contains_key(&fork)
    }

    fn fork_nblocks(&self, relation: &u32, fork: ForkNumber) -> BlockNumber {
        self.relations[relation][&fork]
    }

    fn read_buffer(&self, relation: &u32, fork: ForkNumber, block: BlockNumber) -> bool {
        self.free_buffers.fetch_sub(1, Ordering::Relaxed);
        self.reads.lock().unwrap().push((*relation, fork, block));
        true
    }
}

fn block(database: Oid, filenumber: u32, forknum: ForkNumber, blocknum: BlockNumber) -> BlockInfoRecord {
    BlockInfoRecord {
        database,
        tablespace: TABLESPACE,
        filenumber,
        forknum,
        blocknum,
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    dsm: Dsm,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dsm = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir.path())).unwrap();
        Fixture { dir, dsm }
    }

    fn config(&self) -> PrewarmConfig {
        PrewarmConfig::new(self.dir.path())
    }

    fn prewarm<'p>(
        &self,
        pool: &'p MockPool,
        state: PrewarmState,
        config: PrewarmConfig,
        cancel: CancellationToken,
    ) -> AutoPrewarm<'p, MockPool> {
        AutoPrewarm::new(self.dsm.clone(), state, pool, config, cancel)
    }

    fn write_dump(&self, records: &[BlockInfoRecord]) {
        let mut text = format!("<<{}>>\n", records.len());
        for record in records {
            text.push_str(&format!("{record}\n"));
        }
        std::fs::write(self.config().dump_file, text).unwrap();
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn dump_then_load() {
    let fixture = Fixture::new();
    let source = MockPool::default()
        .tag(block(5, 300, MAIN_FORKNUM, 1), true)
        .tag(block(0, 100, MAIN_FORKNUM, 0), true)
        .tag(block(5, 300, MAIN_FORKNUM, 0), true)
        .tag(block(5, 301, MAIN_FORKNUM, 0), false)
        .tag(block(5, 300, FSM_FORKNUM, 0), true)
        .tag(block(5, 300, MAIN_FORKNUM, 9), true)
        .tag(block(5, 302, MAIN_FORKNUM, 0), true)
        .tag(block(7, 400, MAIN_FORKNUM, 3), true);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&source, state, fixture.config(), CancellationToken::new());
    // Unlogged blocks are left out unless asked for.
    assert_eq!(prewarm.dump_now(DumpRequester::User, false).unwrap(), 7);
    assert_eq!(prewarm.state().pid_using_dump_file(), None);
    drop(prewarm);

    // After the restart 302 is gone and 300's main fork shrank.
    let target = MockPool::with_free_buffers(100)
        .relation(100, &[(MAIN_FORKNUM, 1)])
        .relation(300, &[(MAIN_FORKNUM, 4)])
        .relation(400, &[(MAIN_FORKNUM, 8)]);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&target, state, fixture.config(), CancellationToken::new());
    let stats = prewarm.load_buffers().unwrap();
    assert_eq!(stats.total, 7);
    assert_eq!(stats.prewarmed, 4);
    assert!(!stats.interrupted && !stats.skipped);
    assert_eq!(prewarm.state().prewarmed_blocks(), 4);
    assert_eq!(prewarm.state().pid_using_dump_file(), None);
    assert!(!prewarm.state().batch().block_info_handle.is_valid());

    // Global blocks come with the first database, then blocks in file
    // order: no fsm fork, block 9 past the end, 302 dropped.
    assert_eq!(target.connects(), vec![5, 7]);
    assert_eq!(
        target.reads(),
        vec![
            (100, MAIN_FORKNUM, 0),
            (300, MAIN_FORKNUM, 0),
            (300, MAIN_FORKNUM, 1),
            (400, MAIN_FORKNUM, 3),
        ]
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn missing_dump_file_loads_nothing() {
    let fixture = Fixture::new();
    let pool = MockPool::with_free_buffers(10);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, fixture.config(), CancellationToken::new());
    assert_eq!(prewarm.load_buffers().unwrap(), Default::default());
    assert_eq!(prewarm.state().pid_using_dump_file(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn corrupted_dump_file_fails_the_load() {
    let fixture = Fixture::new();
    std::fs::write(fixture.config().dump_file, "<<2>>\n1,1663,3,0,0\nnope\n").unwrap();
    let pool = MockPool::with_free_buffers(10);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, fixture.config(), CancellationToken::new());
    let err = prewarm.load_buffers().unwrap_err();
    assert!(err.to_string().contains("corrupted at line 3"), "{err}");
    // The claim is given up on failure too.
    assert_eq!(prewarm.state().pid_using_dump_file(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn loading_stops_without_free_buffers() {
    let fixture = Fixture::new();
    fixture.write_dump(&[
        block(5, 300, MAIN_FORKNUM, 0),
        block(5, 300, MAIN_FORKNUM, 1),
        block(5, 300, MAIN_FORKNUM, 2),
        block(7, 400, MAIN_FORKNUM, 0),
    ]);
    let pool = MockPool::with_free_buffers(2)
        .relation(300, &[(MAIN_FORKNUM, 10)])
        .relation(400, &[(MAIN_FORKNUM, 10)]);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, fixture.config(), CancellationToken::new());
    let stats = prewarm.load_buffers().unwrap();
    assert_eq!(stats.prewarmed, 2);
    // Database 7 never gets a worker.
    assert_eq!(pool.connects(), vec![5]);
}

#[tokio::test(start_paused = true)]
#[cfg_attr(miri, ignore)]
async fn leader_dumps_on_interval_and_at_shutdown() {
    let fixture = Fixture::new();
    let pool = MockPool::with_free_buffers(10)
        .tag(block(5, 300, MAIN_FORKNUM, 0), true)
        .tag(block(5, 301, MAIN_FORKNUM, 0), false);
    let cancel = CancellationToken::new();
    let mut config = fixture.config();
    config.interval = Duration::from_secs(10);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, config.clone(), cancel.clone());

    let stop = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        // Two interval dumps so far, with permanent blocks only.
        assert_eq!(pool.scans.load(Ordering::Relaxed), 2);
        let dumped = libdd_prewarm::dump_file::read(&config.dump_file).unwrap().unwrap();
        assert_eq!(dumped.len(), 1);
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(prewarm.run(), stop);
    result.unwrap();

    // The shutdown dump keeps unlogged blocks too.
    assert_eq!(pool.scans.load(Ordering::Relaxed), 3);
    let dumped = libdd_prewarm::dump_file::read(&config.dump_file).unwrap().unwrap();
    assert_eq!(dumped.len(), 2);
    assert_eq!(prewarm.state().leader_pid(), None);
}

#[tokio::test(start_paused = true)]
#[cfg_attr(miri, ignore)]
async fn only_the_first_leader_loads() {
    let fixture = Fixture::new();
    fixture.write_dump(&[block(5, 300, MAIN_FORKNUM, 0)]);
    let pool = MockPool::with_free_buffers(10).relation(300, &[(MAIN_FORKNUM, 1)]);
    let mut config = fixture.config();
    config.interval = Duration::from_secs(10);
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let handle = state.handle();

    let cancel = CancellationToken::new();
    let first = fixture.prewarm(&pool, state, config.clone(), cancel.clone());
    let stop = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(first.run(), stop);
    result.unwrap();
    assert_eq!(pool.reads().len(), 1);

    // A restarted leader in another session finds the load already done.
    let other_dsm = Dsm::new(fixture.dsm.config().clone()).unwrap();
    let restarted = AutoPrewarm::new(
        other_dsm.clone(),
        PrewarmState::attach(&other_dsm, handle).unwrap(),
        &pool,
        config,
        cancel,
    );
    restarted.run().await.unwrap();
    assert_eq!(pool.reads().len(), 1);
}

#[tokio::test(start_paused = true)]
#[cfg_attr(miri, ignore)]
async fn interrupted_load_keeps_the_old_dump() {
    let fixture = Fixture::new();
    let records = [block(5, 300, MAIN_FORKNUM, 0), block(5, 300, MAIN_FORKNUM, 1)];
    fixture.write_dump(&records);
    let pool = MockPool::with_free_buffers(10)
        .relation(300, &[(MAIN_FORKNUM, 2)])
        .tag(block(9, 900, MAIN_FORKNUM, 0), true);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, fixture.config(), cancel);
    prewarm.run().await.unwrap();

    assert!(pool.reads().is_empty());
    assert_eq!(pool.scans.load(Ordering::Relaxed), 0);
    let kept = libdd_prewarm::dump_file::read(&fixture.config().dump_file).unwrap().unwrap();
    assert_eq!(kept, records);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn disabled_leader_refuses_to_run() {
    let fixture = Fixture::new();
    let pool = MockPool::default();
    let mut config = fixture.config();
    config.enabled = false;
    let state = PrewarmState::create(&fixture.dsm).unwrap();
    let prewarm = fixture.prewarm(&pool, state, config, CancellationToken::new());
    assert!(prewarm.run().await.is_err());
    assert_eq!(prewarm.state().leader_pid(), None);
}
