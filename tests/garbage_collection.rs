//! Two-pass network garbage collection

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use common::*;
use netorch::gc::{FreeNetworkWatch, InMemoryFreeNetworkWatch, NetworkGarbageCollector};
use netorch::model::{NetworkState, ReservationContext};

fn collector(f: &Fixture) -> NetworkGarbageCollector {
    NetworkGarbageCollector::new(
        f.orchestrator.clone(),
        Arc::new(InMemoryFreeNetworkWatch::new()),
    )
}

#[tokio::test]
async fn test_idle_network_collected_on_second_pass() {
    let f = fixture();
    let network = f.network("idle").await;
    f.orchestrator
        .implement_network(network.id, &dest(), &ReservationContext::system())
        .await
        .unwrap();
    let gc = collector(&f);
    let start = Utc::now();

    let first = gc.run_at(start).await.unwrap();
    assert_eq!(first.newly_watched, vec![network.id]);
    assert_eq!(
        f.orchestrator.network(network.id).await.unwrap().state,
        NetworkState::Implemented
    );

    let second = gc.run_at(start + Duration::seconds(600)).await.unwrap();
    assert_eq!(second.shut_down, vec![network.id]);

    let stored = f.orchestrator.network(network.id).await.unwrap();
    assert_eq!(stored.state, NetworkState::Allocated);
    assert_eq!(stored.broadcast_uri, None);
    assert!(!stored.check_for_gc);
}

#[tokio::test]
async fn test_network_in_use_between_passes_survives() {
    let f = fixture();
    let network = f.network("busy").await;
    f.orchestrator
        .implement_network(network.id, &dest(), &ReservationContext::system())
        .await
        .unwrap();
    let gc = collector(&f);
    let start = Utc::now();

    gc.run_at(start).await.unwrap();

    let vm = running_vm(100);
    f.orchestrator
        .allocate(&vm, &[(network.clone(), vec![])], &HashMap::new())
        .await
        .unwrap();
    f.orchestrator
        .prepare(&vm, &dest(), &ReservationContext::system())
        .await
        .unwrap();

    let second = gc.run_at(start + Duration::seconds(600)).await.unwrap();
    assert!(second.shut_down.is_empty());
    assert!(gc.watch().is_empty());
    assert_eq!(
        f.orchestrator.network(network.id).await.unwrap().state,
        NetworkState::Implemented
    );
}

#[tokio::test]
async fn test_allocated_networks_are_never_candidates() {
    let f = fixture();
    f.network("never-implemented").await;
    let gc = collector(&f);

    let report = gc.run_at(Utc::now()).await.unwrap();

    assert_eq!(report.candidates, 0);
    assert!(!report.skipped);
}
