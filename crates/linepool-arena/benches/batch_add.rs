//! Per-polyline `add` against one `add_batch` call.
//!
//! Run with: cargo bench --package linepool-arena --bench batch_add

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use linepool_arena::{Color, PolylineBatch, PolylineManager, PrimitiveId};
use linepool_gpu::HeadlessBackend;

const VERTICES_PER_LINE: usize = 16;

fn polyline(seed: usize) -> Vec<[f32; 3]> {
    (0..VERTICES_PER_LINE)
        .map(|i| [seed as f32, i as f32, (seed ^ i) as f32 * 0.25])
        .collect()
}

fn benchmark_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_polylines");

    for count in [1_000usize, 10_000] {
        let lines: Vec<Vec<[f32; 3]>> = (0..count).map(polyline).collect();
        let ids: Vec<PrimitiveId> = (0..count as u64).map(PrimitiveId).collect();
        let positions: Vec<f32> = lines.iter().flatten().flatten().copied().collect();
        let counts = vec![VERTICES_PER_LINE; count];

        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("loop", count), &lines, |b, lines| {
            b.iter_batched(
                || PolylineManager::new(HeadlessBackend::new()),
                |manager| {
                    for (i, line) in lines.iter().enumerate() {
                        black_box(manager.add(PrimitiveId(i as u64), line, Color::RED).unwrap());
                    }
                    manager
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("batch", count), &positions, |b, positions| {
            b.iter_batched(
                || PolylineManager::new(HeadlessBackend::new()),
                |manager| {
                    let batch = PolylineBatch::new(&ids, positions, &counts, Color::RED);
                    black_box(manager.add_batch(&[batch]).unwrap());
                    manager
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn benchmark_defragment(c: &mut Criterion) {
    c.bench_function("defragment_half_removed", |b| {
        b.iter_batched(
            || {
                let manager = PolylineManager::new(HeadlessBackend::new());
                for i in 0..5_000usize {
                    manager
                        .add(PrimitiveId(i as u64), &polyline(i), Color::GREEN)
                        .unwrap();
                }
                let removed: Vec<PrimitiveId> = (0..5_000u64).step_by(2).map(PrimitiveId).collect();
                manager.remove_batch(&removed).unwrap();
                manager
            },
            |manager| {
                black_box(manager.defragment_now().unwrap());
                manager
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, benchmark_add, benchmark_defragment);
criterion_main!(benches);
