// benches/coordinator_bench.rs

//! Coordinator throughput benchmarks: how long a config-update reconciliation
//! batch takes to apply as the pool size grows, and how long a monitor event
//! takes to propagate through depool/repool.

use criterion::{criterion_group, criterion_main, Criterion};
use quorumlb::core::coordinator::{Coordinator, CoordinatorCommand, DesiredServer};
use quorumlb::core::kernel::{FwMethod, KernelTableDriver, Protocol, Scheduler, ServiceDescriptor};
use quorumlb::core::monitor::{MonitorConfig, MonitorEvent, MonitorOutcome};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

fn spawn_test_coordinator() -> mpsc::Sender<CoordinatorCommand> {
    let service = ServiceDescriptor {
        name: "bench".into(),
        protocol: Protocol::Tcp,
        vip: "10.0.0.1".parse().unwrap(),
        port: 80,
        scheduler: Scheduler::Wrr,
    };
    let (events_tx, _events_rx) = mpsc::channel(256);
    let driver = Arc::new(KernelTableDriver::new("/bin/true", true));
    let coordinator = Coordinator::new(
        service,
        0.0,
        false,
        vec![],
        Arc::new(MonitorConfig::default()),
        driver,
        events_tx,
    );
    quorumlb::core::coordinator::spawn(coordinator)
}

fn desired_servers(count: usize) -> Vec<DesiredServer> {
    (0..count)
        .map(|i| DesiredServer {
            host: format!("10.1.{}.{}", i / 256, i % 256),
            weight: 10,
            enabled: true,
            fwmethod: FwMethod::Gate,
        })
        .collect()
}

async fn snapshot(tx: &mpsc::Sender<CoordinatorCommand>) {
    let (reply, rx) = oneshot::channel();
    tx.send(CoordinatorCommand::Snapshot { reply }).await.unwrap();
    let _ = rx.await;
}

fn bench_config_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator_config_update");

    for &count in &[10usize, 100, 500] {
        group.bench_function(format!("{count}_servers"), |b| {
            let rt = Runtime::new().unwrap();
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let tx = spawn_test_coordinator();
                    let desired = desired_servers(count);
                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        tx.send(CoordinatorCommand::ConfigUpdate { desired: desired.clone() }).await.unwrap();
                        snapshot(&tx).await;
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

fn bench_monitor_event_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator_monitor_event");

    group.bench_function("down_up_cycle", |b| {
        let rt = Runtime::new().unwrap();
        b.iter_custom(|iters| {
            rt.block_on(async {
                let tx = spawn_test_coordinator();
                tx.send(CoordinatorCommand::ConfigUpdate { desired: desired_servers(20) }).await.unwrap();
                snapshot(&tx).await;

                let start = std::time::Instant::now();
                for i in 0..iters {
                    let host = format!("10.1.0.{}", (i as usize) % 20);
                    tx.send(CoordinatorCommand::MonitorEvent(MonitorEvent {
                        server_host: host.clone(),
                        monitor_name: "bench",
                        outcome: MonitorOutcome::Down { reason: "bench".into() },
                    }))
                    .await
                    .unwrap();
                    tx.send(CoordinatorCommand::MonitorEvent(MonitorEvent {
                        server_host: host,
                        monitor_name: "bench",
                        outcome: MonitorOutcome::Up,
                    }))
                    .await
                    .unwrap();
                }
                snapshot(&tx).await;
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_config_update, bench_monitor_event_fanout);
criterion_main!(benches);
