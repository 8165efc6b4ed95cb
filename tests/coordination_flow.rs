//! Cross-component coordination flows over the in-memory store:
//! ownership mutual exclusion, lease cascade, atomic transfer, table
//! version ordering, retry contract, and bulk eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use wolfpack::prelude::*;
use wolfpack::retry::retry_transient;

fn test_config() -> CoordinationConfig {
    CoordinationConfig::from_toml("[cluster]\nname = \"flow\"").unwrap()
}

fn layer(store: Arc<MemoryStore>) -> Coordination {
    Coordination::with_store(store, &test_config())
}

fn node(port: u16) -> NodeAddress {
    NodeAddress::new(format!("10.0.0.1:{}", port).parse().unwrap(), 1)
}

fn entry(node: NodeAddress) -> MembershipEntry {
    let mut entry = MembershipEntry::new(node, "host-a", format!("worker-{}", node.endpoint.port()));
    entry.status = NodeStatus::Active;
    entry
}

#[tokio::test]
async fn test_concurrent_registration_has_exactly_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let layer = Arc::new(layer(store));
    let cancel = CancellationToken::new();
    let entity = EntityId::from("player-7");

    let attempts: Vec<_> = (0..4u16)
        .map(|i| {
            let layer = Arc::clone(&layer);
            let cancel = cancel.clone();
            let entity = entity.clone();
            tokio::spawn(async move {
                layer.directory.register(&entity, &node(7654 + i), &cancel).await
            })
        })
        .collect();

    let outcomes: Vec<RegisterOutcome> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners: Vec<&RegisterOutcome> =
        outcomes.iter().filter(|o| o.is_registered()).collect();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, RegisterOutcome::Conflict))
        .count();
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 3);

    // Lookup agrees with the single winner
    let record = layer.directory.lookup(&entity, &cancel).await.unwrap().unwrap();
    match winners[0] {
        RegisterOutcome::Registered(won) => assert_eq!(won.node, record.node),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_explicit_session_destroy_cascades_ownership() {
    let store = Arc::new(MemoryStore::new());
    let layer = layer(store);
    let cancel = CancellationToken::new();
    let owner = node(7654);

    let entities = [
        EntityId::from("player-1"),
        EntityId::from("player-2"),
        EntityId::from("player-3"),
    ];
    for entity in &entities {
        let outcome = layer.directory.register(entity, &owner, &cancel).await.unwrap();
        assert!(outcome.is_registered());
    }

    layer.directory.unregister_nodes(&[owner], &cancel).await.unwrap();

    for entity in &entities {
        assert!(layer.directory.lookup(entity, &cancel).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_ttl_expiry_cascades_ownership() {
    let store = Arc::new(MemoryStore::new());
    let layer = layer(store.clone());
    let cancel = CancellationToken::new();
    let owner = node(7654);
    let entity = EntityId::from("player-7");

    layer.directory.register(&entity, &owner, &cancel).await.unwrap();

    // The store invalidates the lease itself, as TTL expiry would
    let sessions = store.list_sessions().await.unwrap();
    let lease = sessions
        .iter()
        .find(|s| s.name == owner.to_string())
        .expect("owner holds a lease");
    assert!(store.expire_session(&lease.id).await);

    assert!(layer.directory.lookup(&entity, &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_atomic_transfer_between_healthy_nodes() {
    let store = Arc::new(MemoryStore::new());
    let layer = layer(store.clone());
    let cancel = CancellationToken::new();
    let entity = EntityId::from("player-7");
    let (a, b) = (node(7654), node(7655));

    layer.directory.register(&entity, &a, &cancel).await.unwrap();

    let outcome = layer
        .directory
        .register_with_previous(&entity, &b, Some(&a), &cancel)
        .await
        .unwrap();
    assert!(outcome.is_registered());
    let record = layer.directory.lookup(&entity, &cancel).await.unwrap().unwrap();
    assert_eq!(record.node, b);

    // A deterministically failing transfer leaves no half state
    let entity2 = EntityId::from("player-8");
    layer.directory.register(&entity2, &a, &cancel).await.unwrap();
    store.set_txn_failure(true).await;

    let outcome = layer
        .directory
        .register_with_previous(&entity2, &b, Some(&a), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::TransferFailed);
    let record = layer.directory.lookup(&entity2, &cancel).await.unwrap().unwrap();
    assert_eq!(record.node, a);
}

#[tokio::test]
async fn test_table_version_never_regresses() {
    let store = Arc::new(MemoryStore::new());
    let layer = layer(store);
    let cancel = CancellationToken::new();

    let mut observed = Vec::new();
    for port in [7654u16, 7655, 7656, 7657, 7654, 7655] {
        let row = entry(node(port));
        let (_, before) = layer.membership.read_all(&cancel).await.unwrap();
        layer.membership.insert_row(&row, &before, &cancel).await.unwrap();

        // A third reader sees the advanced version
        let (_, after) = layer.membership.read_all(&cancel).await.unwrap();
        assert!(after.counter > before.counter);
        observed.push(after.counter);
    }

    assert!(observed.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_contract_on_injected_timeouts() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    };
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let started = tokio::time::Instant::now();
    let counter = Arc::clone(&attempts);
    let value = retry_transient("flaky op", &policy, &cancel, move || {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 2 {
                Err(Error::Timeout("flaky op".into()))
            } else {
                Ok(99u32)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 99);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_non_matching_fault_fails_without_delay() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    };
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let started = tokio::time::Instant::now();
    let counter = Arc::clone(&attempts);
    let result: Result<u32> = retry_transient("doomed op", &policy, &cancel, move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store("permission denied".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(Error::Store(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn test_bulk_eviction_issues_no_per_entity_deletes() {
    let store = Arc::new(MemoryStore::new());
    let layer = layer(store.clone());
    let cancel = CancellationToken::new();
    let (a, b, c) = (node(7654), node(7655), node(7656));

    for member in [a, b, c] {
        layer
            .membership
            .insert_row(&entry(member), &TableVersion::initial(), &cancel)
            .await
            .unwrap();
    }

    let owned_by_a = [EntityId::from("a-1"), EntityId::from("a-2"), EntityId::from("a-3")];
    let owned_by_b = [EntityId::from("b-1"), EntityId::from("b-2")];
    let owned_by_c = [EntityId::from("c-1")];
    for entity in &owned_by_a {
        layer.directory.register(entity, &a, &cancel).await.unwrap();
    }
    for entity in &owned_by_b {
        layer.directory.register(entity, &b, &cancel).await.unwrap();
    }
    for entity in &owned_by_c {
        layer.directory.register(entity, &c, &cancel).await.unwrap();
    }

    layer.directory.unregister_nodes(&[a, b], &cancel).await.unwrap();

    for entity in owned_by_a.iter().chain(&owned_by_b) {
        assert!(layer.directory.lookup(entity, &cancel).await.unwrap().is_none());
    }
    // The survivor keeps its placements
    let record = layer.directory.lookup(&owned_by_c[0], &cancel).await.unwrap().unwrap();
    assert_eq!(record.node, c);

    let (members, _) = layer.membership.read_all(&cancel).await.unwrap();
    let listed: Vec<NodeAddress> = members.iter().map(|m| m.node).collect();
    assert_eq!(listed, vec![c]);

    // Eviction went through session destruction alone
    let counters = store.counters().await;
    assert_eq!(counters.kv_delete, 0);
    assert_eq!(counters.deregister_service, 0);
    assert_eq!(counters.destroy_session, 2);
}

#[tokio::test]
async fn test_restarted_process_recovers_its_lease() {
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let owner = node(7654);
    let entity = EntityId::from("player-7");

    // First incarnation registers and goes away without cleanup
    let first = layer(store.clone());
    first.directory.register(&entity, &owner, &cancel).await.unwrap();
    drop(first);

    // The restarted process reconnects before the lease expires and
    // picks it back up instead of creating a second one
    let second = layer(store.clone());
    let outcome = second.directory.register(&entity, &owner, &cancel).await.unwrap();
    assert!(outcome.is_registered());
    assert_eq!(store.counters().await.create_session, 1);
}
