use std::{io, thread};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rma_shared::{engine, fabric::loopback::LoopbackFabric, BenchParams, RunConfig};

const THREADS: usize = 2;
const NUM_MESSAGES: usize = THREADS * 16_384;

pub fn put_window_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback put window");
    for message_size in [8, 4096] {
        for window_size in (0..=4).map(|i| 1 << (i * 2)) {
            let config = RunConfig::new(BenchParams {
                threads: THREADS,
                window_size,
                num_messages: Some(NUM_MESSAGES),
                message_size,
            })
            .unwrap();

            // Warm-up and timed phase both put every message.
            group.throughput(Throughput::Bytes(
                (2 * config.num_messages() * THREADS * message_size) as u64,
            ));
            group.bench_with_input(
                BenchmarkId::new(format!("Message Size {}", message_size), window_size),
                &config,
                |b, config| {
                    let pair = LoopbackFabric::pair();
                    b.iter(|| loopback_run(&pair, config));
                },
            );
        }
    }
}

fn loopback_run((source, sink): &(LoopbackFabric, LoopbackFabric), config: &RunConfig) {
    thread::scope(|s| {
        let sink_rank = s.spawn(|| engine::run(sink, config, &mut io::sink()));
        engine::run(source, config, &mut io::sink()).unwrap();
        sink_rank.join().unwrap().unwrap();
    });
}

criterion_group!(benches, put_window_benchmark);
criterion_main!(benches);
