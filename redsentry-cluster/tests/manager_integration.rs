//! End-to-end coordinator scenarios against in-process fakes

use std::sync::Arc;
use std::time::Duration;

use redsentry_cluster::test_support::{FakeFactory, FakeRedis};
use redsentry_cluster::{
    ClusterView, CoordinationClient, FailoverClient, ManagerConfig, ManagerState,
    MemoryCoordination, NodeManager,
};
use redsentry_core::{Error, HostConfig, LowestMeanLatency, SimpleMajority};

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        node_id: "test-coordinator".to_string(),
        probe_interval: Duration::from_millis(10),
        max_probe_errors: 1,
        leadership_wait: Duration::from_millis(10),
        reconcile_interval: Duration::from_millis(20),
        startup_timeout: Duration::from_secs(5),
    }
}

fn cluster(
    instances: &[&Arc<FakeRedis>],
) -> (Arc<NodeManager>, Arc<MemoryCoordination>) {
    let factory = FakeFactory::new();
    for instance in instances {
        factory.register((*instance).clone());
    }

    let coordination = Arc::new(MemoryCoordination::new());
    let manager = NodeManager::new(
        fast_config(),
        instances.iter().map(|i| i.host().clone()).collect(),
        Arc::new(factory),
        coordination.clone(),
        Arc::new(SimpleMajority),
        Arc::new(LowestMeanLatency),
    );

    (manager, coordination)
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn bootstrap_adopts_the_self_reported_primary() {
    let primary = FakeRedis::primary("redis-1", 6379);
    let first = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
    let second = FakeRedis::replica_of("redis-3", 6381, "redis-1", 6379);
    let (manager, _coordination) = cluster(&[&primary, &first, &second]);

    manager.clone().start().await.unwrap();
    let elected = manager
        .wait_until_primary(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&elected, primary.host());

    let status = manager.current_status();
    assert_eq!(status.primary(), Some(primary.host()));
    assert_eq!(status.replicas().len(), 2);
    assert!(status.unavailable().is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn bootstrap_without_any_primary_is_fatal() {
    let first = FakeRedis::replica_of("redis-1", 6379, "redis-9", 6379);
    let second = FakeRedis::replica_of("redis-2", 6380, "redis-9", 6379);
    let (manager, _coordination) = cluster(&[&first, &second]);

    manager.clone().start().await.unwrap();
    wait_for("coordinator shutdown", || {
        manager.state() == ManagerState::Stopped
    })
    .await;

    assert!(!manager.current_status().has_primary());
    assert!(matches!(
        manager.wait_until_primary(Duration::from_millis(50)).await,
        Err(Error::Timeout(_))
    ));
}

#[tokio::test]
async fn lost_replica_is_published_unavailable() {
    let primary = FakeRedis::primary("redis-1", 6379);
    let replica = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
    let (manager, _coordination) = cluster(&[&primary, &replica]);

    manager.clone().start().await.unwrap();
    wait_for("bootstrap election", || {
        manager.current_status().has_primary()
    })
    .await;

    replica.fail(true);
    wait_for("replica marked unavailable", || {
        manager
            .current_status()
            .unavailable()
            .contains(replica.host())
    })
    .await;

    let status = manager.current_status();
    assert_eq!(status.primary(), Some(primary.host()));
    assert!(status.replicas().is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn lost_primary_fails_over_to_the_fastest_replica() {
    let primary = FakeRedis::primary("redis-1", 6379);
    let fast = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
    let slow = FakeRedis::replica_of("redis-3", 6381, "redis-1", 6379);
    slow.set_ping_delay(Duration::from_millis(80));
    let (manager, _coordination) = cluster(&[&primary, &fast, &slow]);

    manager.clone().start().await.unwrap();
    wait_for("bootstrap election", || {
        manager.current_status().has_primary()
    })
    .await;

    primary.fail(true);
    wait_for("failover to the fast replica", || {
        manager.current_status().primary() == Some(fast.host())
    })
    .await;

    // The promoted instance actually received REPLICAOF NO ONE
    wait_for("promotion applied", || fast.is_role_primary()).await;
    // The surviving replica gets reattached to the new primary
    wait_for("replica reattached", || {
        slow.replicates() == Some(("redis-2".to_string(), 6380))
    })
    .await;

    let status = manager.current_status();
    assert!(status.unavailable().contains(primary.host()));

    manager.stop().await;
}

#[tokio::test]
async fn manual_failover_promotes_and_consumes_the_request() {
    let primary = FakeRedis::primary("redis-1", 6379);
    let target = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
    let (manager, coordination) = cluster(&[&primary, &target]);

    manager.clone().start().await.unwrap();
    wait_for("bootstrap election", || {
        manager.current_status().has_primary()
    })
    .await;

    coordination
        .request_manual_failover(target.host())
        .await
        .unwrap();
    wait_for("manual promotion", || {
        manager.current_status().primary() == Some(target.host())
    })
    .await;
    wait_for("request consumed", || target.is_role_primary()).await;
    assert_eq!(coordination.manual_failover_target().await.unwrap(), None);

    // Re-requesting the now-primary target is a consumed no-op
    coordination
        .request_manual_failover(target.host())
        .await
        .unwrap();
    let mut cleared = false;
    for _ in 0..500 {
        if coordination
            .manual_failover_target()
            .await
            .unwrap()
            .is_none()
        {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "no-op manual failover request was not consumed");
    assert_eq!(manager.current_status().primary(), Some(target.host()));

    manager.stop().await;
}

#[tokio::test]
async fn router_follows_a_failover() {
    let primary = FakeRedis::primary("redis-1", 6379);
    let replica = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);

    let factory = FakeFactory::new();
    factory.register(primary.clone());
    factory.register(replica.clone());
    let factory = Arc::new(factory);

    let coordination = Arc::new(MemoryCoordination::new());
    let manager = NodeManager::new(
        fast_config(),
        vec![primary.host().clone(), replica.host().clone()],
        factory.clone(),
        coordination,
        Arc::new(SimpleMajority),
        Arc::new(LowestMeanLatency),
    );

    manager.clone().start().await.unwrap();
    wait_for("bootstrap election", || {
        manager.current_status().has_primary()
    })
    .await;

    let view: Arc<dyn ClusterView> = manager.clone();
    let client = FailoverClient::new(view, factory);

    client.set("color", "red").await.unwrap();
    assert_eq!(primary.value("color"), Some("red".to_string()));

    primary.fail(true);
    wait_for("failover to the replica", || {
        manager.current_status().primary() == Some(replica.host())
    })
    .await;

    client.set("color", "blue").await.unwrap();
    assert_eq!(replica.value("color"), Some("blue".to_string()));

    client.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn startup_times_out_without_reports() {
    let unreachable = HostConfig::new("redis-9", 6379);
    let factory = FakeFactory::new();

    let coordination = Arc::new(MemoryCoordination::new());
    let manager = NodeManager::new(
        ManagerConfig {
            // High threshold so the probe never settles on a state
            max_probe_errors: u32::MAX,
            startup_timeout: Duration::from_millis(200),
            ..fast_config()
        },
        vec![unreachable],
        Arc::new(factory),
        coordination,
        Arc::new(SimpleMajority),
        Arc::new(LowestMeanLatency),
    );

    let err = manager.clone().start().await;
    assert!(matches!(err, Err(redsentry_core::Error::Timeout(_))));

    manager.stop().await;
}
