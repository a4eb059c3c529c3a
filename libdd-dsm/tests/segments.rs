// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use libdd_dsm::{Dsm, DsmConfig, DsmError, DsmImpl};

fn sessions(implementation: DsmImpl, dir: &tempfile::TempDir) -> (Dsm, Dsm) {
    let config = DsmConfig::new(implementation, dir.path());
    (
        Dsm::new(config.clone()).unwrap(),
        Dsm::new(config).unwrap(),
    )
}

fn shared_across_sessions(implementation: DsmImpl) {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(implementation, &dir);

    let seg = a.create(10_000).unwrap();
    let handle = seg.handle();
    unsafe { seg.address().as_ptr().write_bytes(0xab, 16) };

    let other = b.attach(handle).unwrap();
    assert_ne!(seg.address(), other.address());
    assert_eq!(seg.size(), other.size());
    assert_eq!(unsafe { other.address().as_ptr().add(15).read() }, 0xab);

    drop(seg);
    assert!(a.is_attached(handle).unwrap());
    drop(other);
    assert!(!a.is_attached(handle).unwrap());
    assert!(matches!(b.attach(handle), Err(DsmError::NotFound(_))));
}

#[test]
#[cfg_attr(miri, ignore)]
fn anonymous_segments_are_shared() {
    shared_across_sessions(DsmImpl::Anonymous);
}

#[test]
#[cfg_attr(miri, ignore)]
fn mmap_segments_are_shared() {
    shared_across_sessions(DsmImpl::Mmap);
}

#[test]
#[cfg_attr(miri, ignore)]
fn posix_segments_are_shared() {
    shared_across_sessions(DsmImpl::Posix);
}

#[test]
#[cfg_attr(miri, ignore)]
fn double_attach_is_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _) = sessions(DsmImpl::Anonymous, &dir);
    let seg = a.create(100).unwrap();
    let err = a.attach(seg.handle()).unwrap_err();
    assert!(matches!(err, DsmError::Misuse(_)), "{err}");
}

#[test]
#[cfg_attr(miri, ignore)]
fn pinned_segment_outlives_its_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(DsmImpl::Anonymous, &dir);
    let seg = a.create(100).unwrap();
    let handle = seg.handle();
    seg.pin().unwrap();
    assert!(seg.is_pinned());
    assert!(matches!(seg.pin(), Err(DsmError::Misuse(_))));
    drop(seg);

    assert!(b.is_attached(handle).unwrap());
    let again = b.attach(handle).unwrap();
    drop(again);

    b.unpin_segment(handle).unwrap();
    assert!(!b.is_attached(handle).unwrap());
    assert!(matches!(
        b.unpin_segment(handle),
        Err(DsmError::Misuse(_))
    ));
}

#[test]
#[cfg_attr(miri, ignore)]
fn unpinning_an_unpinned_segment_is_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _) = sessions(DsmImpl::Anonymous, &dir);
    let seg = a.create(100).unwrap();
    assert!(matches!(
        a.unpin_segment(seg.handle()),
        Err(DsmError::Misuse(_))
    ));
}

#[test]
#[cfg_attr(miri, ignore)]
fn pinned_mapping_lives_with_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = sessions(DsmImpl::Anonymous, &dir);
    let seg = a.create(100).unwrap();
    let handle = seg.handle();
    let mapping = seg.pin_mapping(&a);
    assert_eq!(a.pinned_mapping(handle), Some(mapping));
    assert!(b.is_attached(handle).unwrap());

    let seg = a.unpin_mapping(handle).unwrap();
    assert!(a.pinned_mapping(handle).is_none());
    drop(seg);
    assert!(!b.is_attached(handle).unwrap());

    let seg = a.create(100).unwrap();
    let handle = seg.handle();
    seg.pin_mapping(&a);
    drop(a);
    assert!(!b.is_attached(handle).unwrap());
}

#[test]
#[cfg_attr(miri, ignore)]
fn foreign_installation_is_rejected() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir_a.path())).unwrap();
    let b = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir_b.path())).unwrap();
    let seg = a.create(100).unwrap();
    assert!(matches!(
        b.attach(seg.handle()),
        Err(DsmError::Corrupted { .. })
    ));
}
