use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use push_fanout::batcher::{BatchConfig, MessageBatcher, estimate_payload_size};
use push_fanout::domain::OutboundMessage;
use push_fanout::pool::{DeliverySink, InMemoryPool};
use serde_json::{Value, json};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn sample_payload(id: usize) -> Value {
    json!({
        "id": id,
        "kind": "feed.update",
        "title": format!("Article {id}"),
        "summary": "x".repeat(160),
        "tags": ["rust", "tokio", "push"],
    })
}

fn bench_payload_sizing(c: &mut Criterion) {
    let payload = sample_payload(42);
    c.bench_function("estimate_payload_size", |b| {
        b.iter(|| estimate_payload_size(black_box(&payload)));
    });
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("enqueue_throughput");

    for &batch_size in &[10usize, 100, 1000] {
        let messages = 10_000;
        group.throughput(Throughput::Elements(messages as u64));
        group.bench_with_input(
            BenchmarkId::new("single_destination", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| async move {
                    let pool = Arc::new(InMemoryPool::<Value>::new().without_recording());
                    pool.register("sid_bench");
                    let sink: Arc<dyn DeliverySink<Value>> = pool.clone();
                    let batcher = MessageBatcher::new(
                        BatchConfig {
                            batch_size,
                            max_batch_bytes: usize::MAX,
                            batch_timeout: Duration::from_secs(60),
                        },
                        sink,
                    );

                    for i in 0..messages {
                        let message = OutboundMessage::new("sid_bench", "update", sample_payload(i));
                        black_box(batcher.enqueue(message, false).await);
                    }
                    batcher.flush_all().await;
                    batcher.cancel_timers();
                    black_box(pool.delivered_messages())
                });
            },
        );
    }

    group.finish();
}

fn bench_flush_all_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("flush_all");

    for &destinations in &[10usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("destinations", destinations),
            &destinations,
            |b, &destinations| {
                b.to_async(&rt).iter(|| async move {
                    let pool = Arc::new(InMemoryPool::<Value>::new().without_recording());
                    let ids: Vec<String> = (0..destinations).map(|i| format!("sid_{i}")).collect();
                    for id in &ids {
                        pool.register(id.as_str());
                    }
                    let sink: Arc<dyn DeliverySink<Value>> = pool.clone();
                    let batcher = MessageBatcher::new(
                        BatchConfig {
                            batch_size: 1000,
                            max_batch_bytes: usize::MAX,
                            batch_timeout: Duration::from_secs(60),
                        },
                        sink,
                    );

                    for id in &ids {
                        for i in 0..5 {
                            batcher
                                .enqueue(OutboundMessage::new(id.as_str(), "update", sample_payload(i)), false)
                                .await;
                        }
                    }
                    black_box(batcher.flush_all().await)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_payload_sizing,
    bench_enqueue_throughput,
    bench_flush_all_fan_out
);
criterion_main!(benches);
