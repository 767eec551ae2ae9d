/*!
 * GPU Command Queue Benchmarks
 *
 * Producer throughput across ring sizes, readback round trips and fence latency
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hle_kernel::gpu::{BufferUsage, CallLog, DrawCall, GpuQueue, SoftwareBackend};
use hle_kernel::GpuConfig;

const BATCH: usize = 256;

fn queue_with_capacity(ring_capacity: usize) -> (GpuQueue, CallLog) {
    let backend = SoftwareBackend::new();
    let log = backend.call_log();
    let config = GpuConfig {
        ring_capacity,
        ..GpuConfig::default()
    };
    let queue = GpuQueue::new(Box::new(backend), &config).unwrap();
    (queue, log)
}

fn draw() -> DrawCall {
    DrawCall::Direct {
        vertex_count: 3,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    }
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_throughput");

    for capacity in [16usize, 256, 4096] {
        let (queue, log) = queue_with_capacity(capacity);

        group.bench_with_input(BenchmarkId::from_parameter(capacity), &queue, |b, queue| {
            b.iter(|| {
                for _ in 0..BATCH {
                    queue.draw(black_box(draw())).unwrap();
                }
                queue.flush();
                // The software backend records every call
                log.clear();
            });
        });

        queue.shutdown();
    }

    group.finish();
}

fn bench_buffer_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_round_trip");

    for size in [64u64, 4096, 65536] {
        let (queue, log) = queue_with_capacity(256);
        let buffer = queue.create_buffer(size, BufferUsage::STORAGE | BufferUsage::TRANSFER).unwrap();
        let data = vec![0x5Au8; size as usize];

        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                queue.set_buffer_data(buffer, 0, data.as_slice()).unwrap();
                let bytes = queue.get_buffer_data(buffer, 0, size).unwrap();
                log.clear();
                black_box(bytes)
            });
        });

        queue.shutdown();
    }

    group.finish();
}

fn bench_fence_latency(c: &mut Criterion) {
    let (queue, log) = queue_with_capacity(256);

    c.bench_function("fence_latency_idle", |b| {
        b.iter(|| {
            queue.finish().unwrap();
            log.clear();
        });
    });

    c.bench_function("fence_latency_behind_draws", |b| {
        b.iter(|| {
            for _ in 0..32 {
                queue.draw(draw()).unwrap();
            }
            queue.finish().unwrap();
            log.clear();
        });
    });

    queue.shutdown();
}

criterion_group!(benches, bench_enqueue_throughput, bench_buffer_round_trip, bench_fence_latency);
criterion_main!(benches);
