// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::Throughput::Elements;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use libdd_dsa::{DsaArea, DsaConfig};
use libdd_dsm::{Dsm, DsmConfig, DsmImpl};
use std::hint::black_box;

const OBJECTS: usize = 1000;

fn allocate_free(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let dsm = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir.path())).unwrap();
    let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();

    let mut group = c.benchmark_group("dsa/allocate_free");
    group.throughput(Elements(OBJECTS as u64));
    for size in [16usize, 200, 4000, 20_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched_ref(
                || Vec::with_capacity(OBJECTS),
                |pointers| {
                    for _ in 0..OBJECTS {
                        pointers.push(black_box(area.allocate(size).unwrap()));
                    }
                    for p in pointers.drain(..) {
                        area.free(p).unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn get_address(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let dsm = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir.path())).unwrap();
    let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();
    let pointers: Vec<_> = (0..OBJECTS).map(|_| area.allocate(64).unwrap()).collect();

    c.bench_function("dsa/get_address", |b| {
        b.iter(|| {
            for p in &pointers {
                black_box(area.get_address(*p).unwrap());
            }
        })
    });
}

criterion_group!(benches, allocate_free, get_address);
criterion_main!(benches);
