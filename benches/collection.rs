//! Collection micro-benchmarks: set, point lookup, bounded scans, and the
//! two spatial traversals.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian::core::{Collection, Status};
use meridian::Object;

fn populated(n: usize) -> Collection {
    let mut col = Collection::new();
    for i in 0..n {
        let lat = (i % 170) as f64 / 2.0 - 40.0;
        let lon = (i % 350) as f64 / 2.0 - 80.0;
        col.set(
            &format!("id{}", i),
            Object::point(lon, lat),
            &["speed".to_string()],
            &[(i % 120) as f64],
        );
    }
    col
}

fn bench_set(c: &mut Criterion) {
    c.bench_function("collection_set_10k", |b| {
        b.iter(|| black_box(populated(10_000)));
    });
}

fn bench_get(c: &mut Criterion) {
    let col = populated(10_000);
    c.bench_function("collection_get", |b| {
        b.iter(|| black_box(col.get("id5123")));
    });
}

fn bench_scan(c: &mut Criterion) {
    let col = populated(10_000);
    let status = Status::background();
    c.bench_function("collection_scan_full", |b| {
        b.iter(|| {
            let mut count = 0u64;
            col.scan(false, None, &status, &mut |_, _, _| {
                count += 1;
                true
            })
            .unwrap();
            black_box(count)
        });
    });
}

fn bench_within(c: &mut Criterion) {
    let col = populated(10_000);
    let status = Status::background();
    let query = Object::Rect(meridian::core::geometry::Rect::new(-20.0, -10.0, 20.0, 10.0));
    c.bench_function("collection_within_window", |b| {
        b.iter(|| {
            let mut count = 0u64;
            col.within(&query, 0, None, &status, &mut |_, _, _| {
                count += 1;
                true
            })
            .unwrap();
            black_box(count)
        });
    });
}

fn bench_nearby(c: &mut Criterion) {
    let col = populated(10_000);
    let status = Status::background();
    let target = Object::point(0.0, 0.0);
    c.bench_function("collection_nearby_100", |b| {
        b.iter(|| {
            let mut count = 0u64;
            col.nearby(&target, None, &status, &mut |_, _, _, _| {
                count += 1;
                count < 100
            })
            .unwrap();
            black_box(count)
        });
    });
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_scan,
    bench_within,
    bench_nearby
);
criterion_main!(benches);
