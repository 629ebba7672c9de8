use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parrot_engine::events::event::{ExecutionEvent, WorkloadEvent};
use parrot_engine::queue::hybrid::HybridEventQueue;
use parrot_engine::utils::config::QueueConfig;
use tempfile::tempdir;

fn event(n: u64) -> WorkloadEvent {
    WorkloadEvent::Execution(
        ExecutionEvent::new(
            50 + (n % 8),
            "select id, status, total from orders where customer_id = 4242",
        )
        .with_database("app")
        .with_offset_ms(n * 10),
    )
}

fn bench_queue(c: &mut Criterion) {
    let dir = tempdir().expect("temp dir");

    c.bench_function("enqueue_dequeue_in_memory_1k", |b| {
        let cfg = QueueConfig {
            buffer_size: 4_096,
            spill_dir: dir.path().to_path_buf(),
            ..QueueConfig::default()
        };
        b.iter(|| {
            let queue = HybridEventQueue::new(&cfg).expect("queue");
            for n in 0..1_000 {
                queue.enqueue(event(n)).expect("enqueue");
            }
            while let Some(event) = queue.try_dequeue() {
                black_box(event);
            }
        });
    });

    c.bench_function("enqueue_dequeue_with_spill_1k", |b| {
        let cfg = QueueConfig {
            buffer_size: 64,
            spill_dir: dir.path().to_path_buf(),
            ..QueueConfig::default()
        };
        b.iter(|| {
            let queue = HybridEventQueue::new(&cfg).expect("queue");
            for n in 0..1_000 {
                queue.enqueue(event(n)).expect("enqueue");
            }
            while let Some(event) = queue.try_dequeue() {
                black_box(event);
            }
        });
    });

    c.bench_function("serialize_event_json_zstd_roundtrip", |b| {
        let payload: Vec<WorkloadEvent> = (0..64).map(event).collect();
        b.iter(|| {
            let json = serde_json::to_vec(&payload).expect("serialize");
            let packed = zstd::encode_all(json.as_slice(), 1).expect("compress");
            let unpacked = zstd::decode_all(packed.as_slice()).expect("decompress");
            let back: Vec<WorkloadEvent> = serde_json::from_slice(&unpacked).expect("deserialize");
            black_box(back);
        });
    });
}

criterion_group!(benches, bench_queue);
criterion_main!(benches);
