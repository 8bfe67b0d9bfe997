use quorumlb::core::coordinator::{Coordinator, CoordinatorCommand, DesiredServer};
use quorumlb::core::kernel::{FwMethod, KernelTableDriver, Protocol, Scheduler, ServiceDescriptor};
use quorumlb::core::monitor::{MonitorConfig, MonitorEvent, MonitorOutcome};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

fn spawn_coordinator(depool_threshold: f64) -> mpsc::Sender<CoordinatorCommand> {
    let service = ServiceDescriptor {
        name: "web".into(),
        protocol: Protocol::Tcp,
        vip: "10.0.0.1".parse().unwrap(),
        port: 80,
        scheduler: Scheduler::Wrr,
    };
    let (events_tx, _events_rx) = mpsc::channel(16);
    let driver = Arc::new(KernelTableDriver::new("/bin/true", true));
    let coordinator = Coordinator::new(
        service,
        depool_threshold,
        false,
        vec![],
        Arc::new(MonitorConfig::default()),
        driver,
        events_tx,
    );
    quorumlb::core::coordinator::spawn(coordinator)
}

async fn snapshot(tx: &mpsc::Sender<CoordinatorCommand>) -> Vec<quorumlb::core::coordinator::ServerSnapshot> {
    let (reply, rx) = oneshot::channel();
    tx.send(CoordinatorCommand::Snapshot { reply }).await.unwrap();
    rx.await.unwrap()
}

fn desired(host: &str) -> DesiredServer {
    DesiredServer { host: host.into(), weight: 10, enabled: true, fwmethod: FwMethod::Gate }
}

#[tokio::test]
async fn config_update_resolves_and_pools_literal_ip_hosts() {
    let tx = spawn_coordinator(0.0);
    tx.send(CoordinatorCommand::ConfigUpdate {
        desired: vec![desired("10.1.0.1"), desired("10.1.0.2")],
    })
    .await
    .unwrap();

    let servers = snapshot(&tx).await;
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().all(|s| s.pooled && s.up));
}

#[tokio::test]
async fn down_event_depools_when_threshold_allows() {
    let tx = spawn_coordinator(0.0);
    tx.send(CoordinatorCommand::ConfigUpdate { desired: vec![desired("10.1.0.1")] }).await.unwrap();
    snapshot(&tx).await;

    tx.send(CoordinatorCommand::MonitorEvent(MonitorEvent {
        server_host: "10.1.0.1".into(),
        monitor_name: "idle_connection",
        outcome: MonitorOutcome::Down { reason: "reset".into() },
    }))
    .await
    .unwrap();

    let servers = snapshot(&tx).await;
    assert!(!servers[0].up);
    assert!(!servers[0].pooled);
}

#[tokio::test]
async fn down_event_is_blocked_by_safety_threshold() {
    let tx = spawn_coordinator(1.0);
    tx.send(CoordinatorCommand::ConfigUpdate {
        desired: vec![desired("10.1.0.1"), desired("10.1.0.2")],
    })
    .await
    .unwrap();
    snapshot(&tx).await;

    tx.send(CoordinatorCommand::MonitorEvent(MonitorEvent {
        server_host: "10.1.0.1".into(),
        monitor_name: "idle_connection",
        outcome: MonitorOutcome::Down { reason: "reset".into() },
    }))
    .await
    .unwrap();

    let servers = snapshot(&tx).await;
    let target = servers.iter().find(|s| s.host == "10.1.0.1").unwrap();
    // Marked down, but still pooled: depooling a single server out of two
    // would drop below the 1.0 safety threshold.
    assert!(!target.up);
    assert!(target.pooled);
}

#[tokio::test]
async fn removing_a_host_from_config_tears_it_down() {
    let tx = spawn_coordinator(0.0);
    tx.send(CoordinatorCommand::ConfigUpdate {
        desired: vec![desired("10.1.0.1"), desired("10.1.0.2")],
    })
    .await
    .unwrap();
    snapshot(&tx).await;

    tx.send(CoordinatorCommand::ConfigUpdate { desired: vec![desired("10.1.0.1")] }).await.unwrap();
    let servers = snapshot(&tx).await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].host, "10.1.0.1");
}
