// packages/engine/benches/ledger_bench.rs
//! Ledger reservation throughput, single instance and contended

use agentcore_engine::ledger::{ResourceLedger, ResourceLimits};
use agentcore_engine::utils::clock::SystemClock;
use agentcore_engine::utils::config::LedgerConfig;
use agentcore_engine::utils::ids::InstanceId;
use agentcore_engine::TrustLevel;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

fn ledger_with(instances: usize) -> (Arc<ResourceLedger>, Vec<InstanceId>) {
    let ledger = Arc::new(ResourceLedger::new(LedgerConfig::default(), Arc::new(SystemClock)));
    let limits = ResourceLimits::for_trust(TrustLevel::Standard).with_tokens_per_window(u64::MAX / 2);
    let ids: Vec<InstanceId> = (0..instances).map(|_| InstanceId::generate()).collect();
    for id in &ids {
        ledger.open(id, &limits);
    }
    (ledger, ids)
}

fn bench_reserve(c: &mut Criterion) {
    let (ledger, ids) = ledger_with(1);
    let id = &ids[0];

    let mut group = c.benchmark_group("ledger_reserve");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_instance", |b| {
        b.iter(|| ledger.reserve(black_box(id), black_box(12)))
    });
    group.bench_function("check_budget", |b| b.iter(|| ledger.check_budget(black_box(id))));
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_contended");
    const PER_THREAD: u64 = 1_000;

    for threads in [2usize, 4, 8] {
        // one instance shared by every thread, then one instance per thread
        for shared in [true, false] {
            let (ledger, ids) = ledger_with(if shared { 1 } else { threads });
            let label = if shared { "shared" } else { "disjoint" };
            group.throughput(Throughput::Elements(PER_THREAD * threads as u64));
            group.bench_with_input(BenchmarkId::new(label, threads), &threads, |b, &threads| {
                b.iter(|| {
                    thread::scope(|scope| {
                        for t in 0..threads {
                            let ledger = &ledger;
                            let id = &ids[t % ids.len()];
                            scope.spawn(move || {
                                for _ in 0..PER_THREAD {
                                    let _ = ledger.reserve(id, 3);
                                }
                            });
                        }
                    });
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_reserve, bench_contended);
criterion_main!(benches);
