//! Benchmark tests for kino-stream hot paths
//!
//! Run with: cargo bench -p kino-stream

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kino_stream::abr::{AbrEngine, AbrInput, ProfileSet};
use kino_stream::buffer::FragmentBuffer;
use kino_stream::config::{AbrConfig, HealthConfig};
use kino_stream::health::BufferHealthMonitor;
use kino_stream::restamp::TrickModeRestamper;
use kino_stream::types::*;

// ============================================================================
// Helpers
// ============================================================================

fn create_test_profiles(count: usize) -> ProfileSet {
    let bandwidths = [400_000u64, 800_000, 1_400_000, 2_800_000, 5_000_000, 7_500_000, 15_000_000];
    ProfileSet::new(
        (0..count)
            .map(|i| {
                let bandwidth = bandwidths[i % bandwidths.len()] + i as u64;
                Profile::new(format!("p{}", i), bandwidth)
            })
            .collect(),
    )
}

// ============================================================================
// ABR Benchmarks
// ============================================================================

fn bench_abr_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("ABR Decide");

    for &count in &[4, 8, 16] {
        let engine = AbrEngine::new(AbrConfig::default(), create_test_profiles(count));
        group.bench_with_input(BenchmarkId::new("decide", count), &count, |b, &count| {
            let mut current = 0;
            b.iter(|| {
                let input = AbrInput {
                    current_profile: current,
                    bandwidth_estimate: Some(4_000_000),
                    health: if current % 2 == 0 { BufferHealth::Green } else { BufferHealth::Yellow },
                    health_run_length: 5,
                    buffered: 6.0,
                    stalled: false,
                };
                if let Ok(Some(switch)) = engine.decide(black_box(&input)) {
                    current = switch.to;
                } else {
                    current = (current + 1) % count;
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Health Benchmarks
// ============================================================================

fn bench_health_record(c: &mut Criterion) {
    let mut monitor = BufferHealthMonitor::new(HealthConfig::default());
    let now = std::time::Instant::now();
    let mut level = 0.0;

    c.bench_function("health_record", |b| {
        b.iter(|| {
            level = (level + 0.7) % 8.0;
            black_box(monitor.record(level, true, now))
        });
    });
}

// ============================================================================
// Restamp Benchmarks
// ============================================================================

fn bench_restamp_timing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Restamp Timing");

    for &rate in &[4.0, 16.0, -8.0] {
        group.bench_with_input(BenchmarkId::new("next_timing", rate), &rate, |b, &rate| {
            let mut restamper = TrickModeRestamper::new(4, 100_000);
            let mut position = 0.0;
            b.iter(|| {
                position += 2.0;
                black_box(restamper.next_timing(position, 2.0, false, false, rate))
            });
        });
    }

    group.finish();
}

// ============================================================================
// Buffer Benchmarks
// ============================================================================

fn bench_buffer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("Fragment Buffer");

    for &size in &[16 * 1024usize, 256 * 1024, 1024 * 1024] {
        let payload = vec![0u8; size];
        group.bench_with_input(BenchmarkId::new("write_read_cycle", size), &payload, |b, payload| {
            let buffer = FragmentBuffer::new(TrackType::Video, 4);
            let cancel = CancellationToken::new();
            b.iter(|| {
                rt.block_on(async {
                    let mut slot = buffer.acquire_write_slot(Duration::from_millis(10), &cancel).await.unwrap();
                    slot.payload.extend_from_slice(payload);
                    slot.duration = 2.0;
                    slot.commit().await.unwrap();

                    let read = buffer.acquire_read_slot(Duration::from_millis(10), &cancel).await.unwrap();
                    black_box(read.payload.len());
                    read.commit().await.unwrap();
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_abr_decide,
    bench_health_record,
    bench_restamp_timing,
    bench_buffer_throughput,
);
criterion_main!(benches);
