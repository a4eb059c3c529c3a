// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two `Dsm` sessions in one process behave like two processes: each maps
//! segments at its own addresses and only learns about freed segments
//! through the area's shared state.

#![cfg(unix)]

use libdd_dsa::{DsaArea, DsaConfig, DsaError, DsaPointer, DEFAULT_INIT_SEGMENT_SIZE};
use libdd_dsm::{Dsm, DsmConfig, DsmImpl};

fn sessions(implementation: DsmImpl, dir: &tempfile::TempDir) -> (Dsm, Dsm) {
    let config = DsmConfig::new(implementation, dir.path());
    (
        Dsm::new(config.clone()).unwrap(),
        Dsm::new(config).unwrap(),
    )
}

/// Fills whole superblocks until something lands outside segment 0.
fn grow(area: &DsaArea) -> Vec<DsaPointer> {
    let mut pointers = Vec::new();
    while pointers.iter().all(|p: &DsaPointer| p.segment_index() == 0) {
        for _ in 0..16 {
            pointers.push(area.allocate(4000).unwrap());
        }
    }
    pointers
}

fn write(area: &DsaArea, p: DsaPointer, bytes: &[u8]) {
    let address = area.get_address(p).unwrap();
    unsafe { address.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
}

fn read(area: &DsaArea, p: DsaPointer, len: usize) -> Vec<u8> {
    let address = area.get_address(p).unwrap();
    unsafe { std::slice::from_raw_parts(address, len).to_vec() }
}

fn shared_between_sessions(implementation: DsmImpl) {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(implementation, &dir);
    let creator = DsaArea::create(&a, DsaConfig::new(1)).unwrap();
    let attached = DsaArea::attach(&b, creator.handle()).unwrap();

    let p = creator.allocate(100).unwrap();
    write(&creator, p, b"hello");
    assert_eq!(read(&attached, p, 5), b"hello");
    assert_ne!(
        creator.get_address(p).unwrap(),
        attached.get_address(p).unwrap()
    );

    let q = attached.allocate(5000).unwrap();
    write(&attached, q, b"from b");
    assert_eq!(read(&creator, q, 6), b"from b");
    creator.free(q).unwrap();
    attached.free(p).unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn anonymous_area_is_shared() {
    shared_between_sessions(DsmImpl::Anonymous);
}

#[test]
#[cfg_attr(miri, ignore)]
fn mmap_area_is_shared() {
    shared_between_sessions(DsmImpl::Mmap);
}

#[test]
#[cfg_attr(miri, ignore)]
fn freed_segments_are_unmapped_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(DsmImpl::Anonymous, &dir);
    let creator = DsaArea::create(&a, DsaConfig::default()).unwrap();
    let attached = DsaArea::attach(&b, creator.handle()).unwrap();

    let pointers = grow(&creator);
    let remote = *pointers.last().unwrap();
    assert_eq!(remote.segment_index(), 1);
    write(&creator, remote, b"segment one");
    assert_eq!(read(&attached, remote, 11), b"segment one");
    assert_eq!(attached.mapped_segments(), 2);

    for p in pointers {
        creator.free(p).unwrap();
    }
    creator.trim().unwrap();
    assert_eq!(creator.total_size(), DEFAULT_INIT_SEGMENT_SIZE);
    assert_eq!(creator.mapped_segments(), 1);

    // The next lookup in the other session notices and drops its mapping.
    let p = attached.allocate(8).unwrap();
    assert_eq!(attached.mapped_segments(), 1);
    assert!(matches!(
        attached.get_address(remote),
        Err(DsaError::Misuse(_))
    ));
    attached.free(p).unwrap();

    // A new segment in the same slot resolves to the new memory.
    let pointers = grow(&creator);
    let fresh = *pointers.last().unwrap();
    assert_eq!(fresh.segment_index(), 1);
    write(&creator, fresh, b"new segment");
    assert_eq!(read(&attached, fresh, 11), b"new segment");
}

#[test]
#[cfg_attr(miri, ignore)]
fn last_detach_destroys_the_area() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(DsmImpl::Anonymous, &dir);
    let creator = DsaArea::create(&a, DsaConfig::default()).unwrap();
    let handle = creator.handle();
    let attached = DsaArea::attach(&b, handle).unwrap();
    grow(&attached);

    drop(creator);
    assert!(b.is_attached(handle).unwrap());
    drop(attached);
    assert!(!b.is_attached(handle).unwrap());
    assert!(DsaArea::attach(&b, handle).is_err());
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _) = sessions(DsmImpl::Anonymous, &dir);
    let area = DsaArea::create(&a, DsaConfig::default()).unwrap();

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let area = &area;
            s.spawn(move || {
                let mut mine = Vec::new();
                for i in 0..2000usize {
                    let size = 8 + (i * 37 + t as usize) % 3000;
                    let p = area.allocate(size).unwrap();
                    unsafe { area.get_address(p).unwrap().write_bytes(t, size) };
                    mine.push((p, size));
                    if i % 3 == 0 {
                        let (p, size) = mine.swap_remove(0);
                        let bytes = read(area, p, size);
                        assert!(bytes.iter().all(|&b| b == t));
                        area.free(p).unwrap();
                    }
                }
                for (p, size) in mine {
                    let bytes = read(area, p, size);
                    assert!(bytes.iter().all(|&b| b == t));
                    area.free(p).unwrap();
                }
            });
        }
    });
    area.trim().unwrap();
    assert_eq!(area.total_size(), DEFAULT_INIT_SEGMENT_SIZE);
}

#[test]
#[cfg_attr(miri, ignore)]
fn dump_is_logged_and_returned() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("libdd_dsa=debug"))
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(DsmImpl::Anonymous, &dir);
    let creator = DsaArea::create(&a, DsaConfig::default()).unwrap();
    let attached = DsaArea::attach(&b, creator.handle()).unwrap();
    let p = creator.allocate(100).unwrap();

    let text = attached.dump().unwrap();
    assert!(text.contains("refcnt: 2"), "{text}");
    assert!(text.contains("segment index 0"), "{text}");
    assert!(text.contains("pool for size class"), "{text}");
    creator.free(p).unwrap();
}
