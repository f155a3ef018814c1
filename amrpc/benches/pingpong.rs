//! Two-rank ping-pong over the in-process mesh.
//!
//! Measures the full rpc cycle (command block out, remote execution,
//! operation ack back) at sizes straddling the eager cutover, and the
//! one-sided rput completion cycle.
//!
//! Run with:
//! ```bash
//! cargo bench --package amrpc --bench pingpong
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use amrpc::{Command, CommandRegistry, Completions, Level, Runtime, RuntimeConfig};

const SINK: u32 = 1;

/// Payload sizes around the default 512-byte remote cutover. The largest
/// block exceeds the frame ceiling and goes fragmented.
const SIZES: &[usize] = &[16, 128, 500, 2048, 8192];

// ============================================================================
// RPC round trip
// ============================================================================

fn bench_rpc_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("rpc_pingpong");
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let registry = Arc::new(CommandRegistry::new().register(SINK, |_, args| {
                black_box(args);
                Vec::new()
            }));
            let rts = Runtime::create_mesh(2, RuntimeConfig::default(), registry);
            let mut p0 = rts[0].master();
            let mut p1 = rts[1].master();
            let payload = vec![0xA5u8; size];

            b.iter(|| {
                let f = p0
                    .rpc(
                        1,
                        Command::new(SINK, payload.clone()),
                        Completions::operation_future(),
                    )
                    .expect("send failed")
                    .into_future();
                while !f.is_resolved() {
                    p0.progress(Level::User);
                    p1.progress(Level::User);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// One-sided put
// ============================================================================

fn bench_rput(c: &mut Criterion) {
    let mut group = c.benchmark_group("rput");
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let rts = Runtime::create_mesh(
                2,
                RuntimeConfig::default(),
                Arc::new(CommandRegistry::new()),
            );
            let mut p0 = rts[0].master();
            let payload = vec![1u8; size];

            b.iter(|| {
                let f = p0
                    .rput(1, 0, payload.clone(), Completions::operation_future())
                    .expect("post failed")
                    .into_future();
                // One-sided completion never needs the remote side's
                // progress.
                while !f.is_resolved() {
                    p0.progress(Level::Internal);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rpc_pingpong, bench_rput);
criterion_main!(benches);
