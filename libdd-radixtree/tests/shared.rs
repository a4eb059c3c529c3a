// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A tree created through one `Dsm` session is used through another, the
//! way a second process would see it.

#![cfg(unix)]

use libdd_dsa::{DsaArea, DsaConfig};
use libdd_dsm::{Dsm, DsmConfig, DsmImpl};
use libdd_radixtree::{RadixTreeError, SharedRadixTree, TreeValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Wide([u64; 4]);

// SAFETY: plain fixed-size data.
unsafe impl TreeValue for Wide {}

fn sessions(dir: &tempfile::TempDir) -> (Dsm, Dsm) {
    let config = DsmConfig::new(DsmImpl::Anonymous, dir.path());
    (
        Dsm::new(config.clone()).unwrap(),
        Dsm::new(config).unwrap(),
    )
}

#[test]
#[cfg_attr(miri, ignore)]
fn visible_from_another_session() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(&dir);
    let creator_area = DsaArea::create(&a, DsaConfig::default()).unwrap();
    let attached_area = DsaArea::attach(&b, creator_area.handle()).unwrap();

    let creator = SharedRadixTree::<Wide>::create(&creator_area, 1).unwrap();
    {
        let mut writer = creator.lock_exclusive();
        for key in (0..3000u64).map(|k| k << 20) {
            writer.set(key, &Wide([key; 4])).unwrap();
        }
    }

    let attached = SharedRadixTree::<Wide>::attach(&attached_area, creator.handle()).unwrap();
    {
        let reader = attached.lock_share();
        assert_eq!(reader.num_keys(), 3000);
        assert_eq!(reader.find(7 << 20).unwrap(), Some(&Wide([7 << 20; 4])));
        assert_eq!(reader.find(7).unwrap(), None);
        let keys: Vec<u64> = reader.iter().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (0..3000u64).map(|k| k << 20).collect::<Vec<_>>());
    }

    {
        let mut writer = attached.lock_exclusive();
        for key in (0..3000u64).filter(|k| k % 2 == 1).map(|k| k << 20) {
            assert!(writer.delete(key).unwrap());
        }
        writer.verify().unwrap();
    }
    assert_eq!(creator.lock_share().num_keys(), 1500);
    assert_eq!(creator.lock_share().stats().num_leaves, 1500);

    let handle = creator.handle();
    drop(attached);
    creator.free().unwrap();
    assert!(matches!(
        SharedRadixTree::<Wide>::attach(&attached_area, handle),
        Err(RadixTreeError::Corrupted(_) | RadixTreeError::Dsa(_))
    ));
}

#[test]
#[cfg_attr(miri, ignore)]
fn readers_and_writers_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _) = sessions(&dir);
    let area = DsaArea::create(&a, DsaConfig::default()).unwrap();
    let tree = SharedRadixTree::<u64>::create(&area, 1).unwrap();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let tree = &tree;
            s.spawn(move || {
                for i in 0..2000u64 {
                    let key = i * 4 + t;
                    tree.lock_exclusive().set(key, &(key * 10)).unwrap();
                    if i % 7 == 0 {
                        let reader = tree.lock_share();
                        assert_eq!(reader.find(key).unwrap(), Some(&(key * 10)));
                    }
                }
            });
        }
    });

    let reader = tree.lock_share();
    assert_eq!(reader.num_keys(), 8000);
    reader.verify().unwrap();
    for (expected, entry) in reader.iter().enumerate() {
        let (key, value) = entry.unwrap();
        assert_eq!(key, expected as u64);
        assert_eq!(*value, key * 10);
    }
    drop(reader);
    tree.free().unwrap();
}
