//! Benchmarks for the coordination fast paths.
//!
//! The costs that matter are the ones applications pay when no checkpoint is
//! anywhere in sight: entering and leaving critical sections, and polling
//! status.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use freezepoint::test_utils::StubChannel;
use freezepoint::{enter_cs, init, leave_cs, status, try_enter_cs};

fn bench_critical_sections(c: &mut Criterion) {
    StubChannel::install();
    let client = init().expect("stub channel installed");

    let mut group = c.benchmark_group("critical_section");

    group.bench_function("enter_leave", |b| {
        b.iter(|| {
            enter_cs(black_box(client)).unwrap();
            leave_cs(black_box(client)).unwrap();
        })
    });

    group.bench_function("enter_leave_nested_4", |b| {
        b.iter(|| {
            for _ in 0..4 {
                enter_cs(black_box(client)).unwrap();
            }
            for _ in 0..4 {
                leave_cs(black_box(client)).unwrap();
            }
        })
    });

    group.bench_function("try_enter_leave", |b| {
        b.iter(|| {
            assert!(try_enter_cs(black_box(client)).unwrap());
            leave_cs(black_box(client)).unwrap();
        })
    });

    group.bench_function("status", |b| {
        b.iter(|| black_box(status().unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_critical_sections);
criterion_main!(benches);
