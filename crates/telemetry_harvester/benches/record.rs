use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use telemetry_harvester::{Config, Count, Gauge, Harvester, Span};

const SPANS_PER_PRODUCER: u64 = 10_000;

fn harvester() -> Harvester {
    // Zero period: no background task, swaps are driven by the bench.
    Harvester::new(Config::new("bench-key").with_harvest_period(Duration::ZERO))
}

fn span(i: u64) -> Span {
    Span::new(format!("span-{i}"), "trace", "GET /checkout")
        .with_duration(Duration::from_millis(12))
        .with_service_name("shop")
        .with_attribute("http.status_code", 200)
        .with_attribute("cache.hit", i % 2 == 0)
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    group.throughput(Throughput::Elements(1));

    let h = harvester();
    group.bench_function("span", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(h.record_span(span(i)));
            if i % 65_536 == 0 {
                black_box(h.swap_out_spans());
            }
        });
    });

    let h = harvester();
    group.bench_function("count", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(h.record_metric(Count {
                name: "requests".into(),
                value: 1.0,
                ..Default::default()
            }));
            if i % 65_536 == 0 {
                black_box(h.swap_out_metrics(SystemTime::now()));
            }
        });
    });

    group.bench_function("gauge_non_integral", |b| {
        b.iter(|| {
            black_box(h.record_metric(Gauge {
                name: "load".into(),
                value: 0.731,
                ..Default::default()
            }));
        });
    });
    black_box(h.swap_out_metrics(SystemTime::now()));

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");

    for producers in [1u64, 2, 4, 8] {
        group.throughput(Throughput::Elements(SPANS_PER_PRODUCER * producers));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{producers}_producers")),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let h = Arc::new(harvester());
                    let handles: Vec<_> = (0..producers)
                        .map(|p| {
                            let h = Arc::clone(&h);
                            thread::spawn(move || {
                                for i in 0..SPANS_PER_PRODUCER {
                                    h.record_span(span(p * SPANS_PER_PRODUCER + i));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    black_box(h.swap_out_spans());
                });
            },
        );
    }

    group.finish();
}

fn bench_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("swap_out");

    for batch in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("spans", batch), &batch, |b, &batch| {
            let h = harvester();
            b.iter(|| {
                for i in 0..batch {
                    h.record_span(span(i));
                }
                black_box(h.swap_out_spans());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record, bench_contended, bench_swap);
criterion_main!(benches);
