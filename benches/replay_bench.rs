use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parrot_engine::events::event::ExecutionEvent;
use parrot_engine::replay::command::{classify, substitute_handle};
use parrot_engine::replay::connection::SimulatedConnectionFactory;
use parrot_engine::replay::registry::{RegistrySettings, SessionRegistry};
use parrot_engine::replay::timing::plan_wait;
use parrot_engine::utils::config::{ReplayConfig, SimulatedTargetConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn bench_command_paths(c: &mut Criterion) {
    let texts = [
        "select id, status from orders where customer_id = 77",
        "exec sp_prepare 4, N'select * from t where id = @p1'",
        "exec sp_execute 4, 1234",
        "exec sp_unprepare 4",
        "exec sp_reset_connection",
        "EXECUTE sp_executesql N'update orders set total = 1'",
    ];
    c.bench_function("classify_command_mix", |b| {
        b.iter(|| {
            for text in &texts {
                black_box(classify(black_box(text)));
            }
        });
    });

    c.bench_function("substitute_handle", |b| {
        b.iter(|| {
            black_box(substitute_handle(
                black_box("exec sp_execute 4, 1234, N'pending'"),
                1_000_157,
            ));
        });
    });

    c.bench_function("plan_wait", |b| {
        b.iter(|| {
            black_box(plan_wait(
                black_box(5_000),
                Duration::from_millis(1_200),
                Duration::from_secs(10),
            ));
        });
    });
}

fn bench_replay_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    let replay_cfg = ReplayConfig {
        command_timeout_ms: 1_000,
        ..ReplayConfig::default()
    };

    c.bench_function("dispatch_and_drain_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let factory = Arc::new(SimulatedConnectionFactory::new(
                    SimulatedTargetConfig::default(),
                ));
                let cancel = CancellationToken::new();
                let registry = SessionRegistry::new(
                    factory,
                    RegistrySettings::from_config(&replay_cfg, 10_000),
                    &cancel,
                );

                for n in 0..100u64 {
                    let event = ExecutionEvent::new(50 + (n % 4), "select 1")
                        .with_database("app");
                    registry.dispatch(&event).await.expect("dispatch");
                }
                while registry.has_pending_work() {
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
                registry.shutdown(Duration::from_secs(1)).await;
            });
        });
    });
}

criterion_group!(benches, bench_command_paths, bench_replay_dispatch);
criterion_main!(benches);
