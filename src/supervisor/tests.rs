//! Connection Supervisor Tests

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::config::{ConfigError, Credentials, InitialEnvironment, ServiceUrl};
use crate::metrics::Metrics;
use crate::transport::{DestinationKind, MemoryBroker, MemoryProvider};

fn supervisor(broker: &MemoryBroker, query: &str) -> Arc<ConnectionSupervisor> {
    supervisor_with(broker, query, InitialEnvironment::new())
}

fn supervisor_with(
    broker: &MemoryBroker,
    query: &str,
    initial: InitialEnvironment,
) -> Arc<ConnectionSupervisor> {
    let provider = MemoryProvider::new().with_broker(broker.clone());
    let url = ServiceUrl::parse(&format!("service:mqmx:memory:///{}?{}", broker.name(), query))
        .unwrap();
    ConnectionSupervisor::from_url(&url, &initial, &provider, Arc::new(Metrics::new())).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_wrong_protocol_is_rejected() {
    let provider = MemoryProvider::new().with_broker(MemoryBroker::new("local"));
    let url = ServiceUrl::parse("service:mqmx:jms:///local").unwrap();
    let result = ConnectionSupervisor::from_url(
        &url,
        &InitialEnvironment::new(),
        &provider,
        Arc::new(Metrics::new()),
    );
    match result {
        Err(Error::Config(ConfigError::MalformedUrl(msg))) => {
            assert_eq!(msg, "Wrong protocol jms for provider")
        }
        _ => panic!("expected a malformed URL error"),
    }
}

#[tokio::test]
async fn test_environment_comes_from_url() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "destination-kind=queue&destination-name=svc&timeout-ms=5");
    assert_eq!(sup.environment().destination_kind, DestinationKind::Queue);
    assert_eq!(sup.environment().destination_name, "svc");
    assert_eq!(sup.environment().receive_timeout, Duration::from_millis(5));
    assert_eq!(sup.url().protocol(), "memory");
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_connect_shares_one_connection() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "");

    let (a, b) = tokio::join!(sup.connect(), sup.connect());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(sup.metrics().connections_established.get(), 1);
}

#[tokio::test]
async fn test_connect_retries_until_broker_starts() {
    let broker = MemoryBroker::new("local");
    broker.stop();
    let sup = supervisor(&broker, "retry-interval-ms=20");

    let pending = tokio::spawn({
        let sup = sup.clone();
        async move { sup.connect().await.map(|c| c.generation()) }
    });
    wait_until(|| sup.metrics().connection_attempts.get() >= 3).await;
    broker.start();

    let generation = pending.await.unwrap().unwrap();
    assert_eq!(generation, 1);
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_pending_connect() {
    let broker = MemoryBroker::new("local");
    broker.stop();
    let sup = supervisor(&broker, "retry-interval-ms=60000");

    let pending = tokio::spawn({
        let sup = sup.clone();
        async move { sup.connect().await.map(|_| ()) }
    });
    wait_until(|| sup.metrics().connection_attempts.get() >= 1).await;
    sup.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(matches!(sup.connect().await, Err(Error::Interrupted)));
    assert!(sup.is_shut_down());
}

#[tokio::test]
async fn test_explicit_credentials_are_used() {
    let broker = MemoryBroker::new("secure").with_credentials("admin", "s3cret");
    let sup = supervisor_with(
        &broker,
        "broker-username=admin&broker-password=wrong",
        InitialEnvironment::new().with_credentials(Credentials::new("admin", "s3cret")),
    );
    sup.connect().await.unwrap();
    assert_eq!(broker.connection_count(), 1);

    let rejected = sup
        .open_connection(Some(&Credentials::new("admin", "nope")))
        .await;
    assert!(matches!(
        rejected,
        Err(Error::Transport(TransportError::Authentication(_)))
    ));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_destroy_releases_everything_and_is_idempotent() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "");

    let conn = sup.connect().await.unwrap();
    sup.create_temporary_destination(&conn).await.unwrap();
    sup.create_temporary_destination(&conn).await.unwrap();
    sup.open_connection(None).await.unwrap();
    assert_eq!(broker.temporary_destination_count(), 2);
    assert_eq!(broker.connection_count(), 2);

    sup.destroy().await;
    assert_eq!(broker.temporary_destination_count(), 0);
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(sup.temporary_destination_count(), 0);
    sup.destroy().await;

    // A new connection is created lazily afterwards
    let next = sup.connect().await.unwrap();
    assert_eq!(next.generation(), 2);
}

#[tokio::test]
async fn test_delete_temporary_destination() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "destination-kind=Queue");

    let conn = sup.connect().await.unwrap();
    let reply = sup.create_temporary_destination(&conn).await.unwrap();
    assert_eq!(reply.kind, DestinationKind::Queue);
    assert_eq!(sup.temporary_destination_count(), 1);

    sup.delete_temporary_destination(&reply).await;
    sup.delete_temporary_destination(&reply).await;
    assert_eq!(sup.temporary_destination_count(), 0);
    assert_eq!(broker.temporary_destination_count(), 0);
}

#[tokio::test]
async fn test_failure_tears_down_then_notifies() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "retry-interval-ms=20");
    let mut notices = sup.failure_notices();

    let conn = sup.connect().await.unwrap();
    sup.create_temporary_destination(&conn).await.unwrap();
    broker.stop();

    let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.generation, 1);
    assert!(conn.is_failed());
    assert_eq!(sup.temporary_destination_count(), 0);
    assert_eq!(sup.metrics().connection_failures.get(), 1);

    broker.start();
    let replacement = sup.connect().await.unwrap();
    assert_eq!(replacement.generation(), 2);
    assert!(!Arc::ptr_eq(&conn, &replacement));
}

#[tokio::test]
async fn test_target_destination_uses_configured_kind() {
    let broker = MemoryBroker::new("local");
    let sup = supervisor(&broker, "destination-name=svc");
    let conn = sup.connect().await.unwrap();
    assert_eq!(
        sup.target_destination(&conn).await.unwrap(),
        Destination::topic("svc")
    );
}
