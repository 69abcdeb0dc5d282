//! Notification Relay Tests
//!
//! Listeners registered through a client connector receive notifications
//! emitted by the served registry, keep receiving them across a broker
//! restart, and see only what their filter accepts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_case::test_case;

use common::{loopback, name, recorder, wait_until, EMITTER};
use mqmx::registry::{ManagementError, Notification, NotificationFilter, NotificationSource};
use mqmx::Error;

const LIMIT: Duration = Duration::from_secs(10);

fn messages(received: &common::Received) -> Vec<String> {
    received
        .lock()
        .iter()
        .map(|(n, _)| n.message.clone())
        .collect()
}

// ============================================================================
// Delivery across a broker restart
// ============================================================================

#[test_case("Queue" ; "queue destination")]
#[test_case("Topic" ; "topic destination")]
#[tokio::test]
async fn test_listener_survives_broker_restart(kind: &str) {
    let lb = loopback(kind, 300).await;
    let emitter = name(EMITTER);
    let (listener, received) = recorder();

    lb.remote
        .add_notification_listener(&emitter, listener, None, None)
        .await
        .unwrap();
    assert_eq!(lb.emitter.listener_count(), 1);

    lb.remote
        .invoke(&emitter, "emit", vec![json!("one")], vec![])
        .await
        .unwrap();
    wait_until(LIMIT, || received.lock().len() == 1).await;
    let (first, handback) = received.lock()[0].clone();
    assert_eq!(first.source, NotificationSource::Resource(emitter.clone()));
    assert_eq!(handback, None);

    // Delivered locally but never forwarded
    lb.emitter.emit_opaque("two");
    wait_until(LIMIT, || lb.server_metrics.notifications_dropped.get() == 1).await;

    lb.broker.stop();
    wait_until(LIMIT, || lb.emitter.listener_count() == 0).await;
    lb.broker.start();
    wait_until(LIMIT, || lb.emitter.listener_count() == 1).await;

    lb.emitter.emit("three");
    wait_until(LIMIT, || received.lock().len() == 2).await;

    // Several retry intervals later nothing was duplicated
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(messages(&received), vec!["one", "three"]);
    assert_eq!(lb.emitter.listener_count(), 1);
    assert!(lb.client_metrics.connection_failures.get() >= 1);
    assert_eq!(lb.client_metrics.notifications_delivered.get(), 2);

    lb.shutdown().await;
}

#[tokio::test]
async fn test_listener_added_during_outage_is_resubscribed() {
    let lb = loopback("Queue", 2_000).await;
    let emitter = name(EMITTER);
    let (first, first_received) = recorder();
    let (second, second_received) = recorder();

    lb.remote
        .add_notification_listener(&emitter, first, None, None)
        .await
        .unwrap();

    // The second subscription waits for the broker while holding the
    // relay, so recovery of the first runs after it
    lb.broker.stop();
    let remote = Arc::clone(&lb.remote);
    let target = emitter.clone();
    let adding = tokio::spawn(async move {
        remote
            .add_notification_listener(&target, second, None, None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    lb.broker.start();
    adding.await.unwrap().unwrap();

    // Re-subscription may still be in flight, so keep emitting
    wait_until(LIMIT, || {
        let done = !first_received.lock().is_empty() && !second_received.lock().is_empty();
        if !done {
            lb.emitter.emit("after");
        }
        done
    })
    .await;
    assert_eq!(lb.emitter.listener_count(), 2);
    assert!(messages(&second_received).iter().all(|m| m == "after"));
    lb.shutdown().await;
}

// ============================================================================
// Filters and handbacks
// ============================================================================

#[tokio::test]
async fn test_filter_and_handback_are_applied() {
    let lb = loopback("Queue", 2_000).await;
    let emitter = name(EMITTER);
    let (listener, received) = recorder();
    let filter: NotificationFilter =
        Arc::new(|n: &Notification| n.message.starts_with("keep"));

    lb.remote
        .add_notification_listener(
            &emitter,
            listener.clone(),
            Some(filter.clone()),
            Some(json!(7)),
        )
        .await
        .unwrap();
    lb.remote
        .add_notification_listener(&emitter, listener.clone(), None, None)
        .await
        .unwrap();
    assert_eq!(lb.emitter.listener_count(), 2);

    lb.emitter.emit("drop");
    lb.emitter.emit("keep 1");
    wait_until(LIMIT, || received.lock().len() == 3).await;
    {
        let seen = received.lock();
        let filtered: Vec<_> = seen.iter().filter(|(_, h)| h.is_some()).collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0.message, "keep 1");
        assert_eq!(filtered[0].1, Some(json!(7)));
    }

    lb.remote
        .remove_notification_listener_with(&emitter, &listener, Some(&filter), Some(&json!(7)))
        .await
        .unwrap();
    wait_until(LIMIT, || lb.emitter.listener_count() == 1).await;

    lb.emitter.emit("keep 2");
    wait_until(LIMIT, || received.lock().len() == 4).await;
    assert_eq!(received.lock()[3].1, None);

    lb.remote
        .remove_notification_listener(&emitter, &listener)
        .await
        .unwrap();
    wait_until(LIMIT, || lb.emitter.listener_count() == 0).await;
    assert!(matches!(
        lb.remote
            .remove_notification_listener(&emitter, &listener)
            .await,
        Err(Error::Management(ManagementError::ListenerNotFound(_)))
    ));

    lb.shutdown().await;
}

#[tokio::test]
async fn test_remove_with_requires_exact_registration() {
    let lb = loopback("Queue", 2_000).await;
    let emitter = name(EMITTER);
    let (listener, _) = recorder();

    lb.remote
        .add_notification_listener(&emitter, listener.clone(), None, Some(json!("a")))
        .await
        .unwrap();

    let err = lb
        .remote
        .remove_notification_listener_with(&emitter, &listener, None, Some(&json!("b")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Management(ManagementError::ListenerNotFound(_))
    ));
    assert_eq!(lb.emitter.listener_count(), 1);

    lb.remote
        .remove_notification_listener_with(&emitter, &listener, None, Some(&json!("a")))
        .await
        .unwrap();
    wait_until(LIMIT, || lb.emitter.listener_count() == 0).await;
    lb.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_closed_client_receives_nothing() {
    let lb = loopback("Queue", 2_000).await;
    let emitter = name(EMITTER);
    let (listener, received) = recorder();

    lb.remote
        .add_notification_listener(&emitter, listener, None, None)
        .await
        .unwrap();
    lb.client.close().await.unwrap();

    // The server keeps the orphaned subscription until it stops
    assert_eq!(lb.emitter.listener_count(), 1);
    lb.emitter.emit("late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(received.lock().is_empty());

    lb.server.stop().await.unwrap();
    assert_eq!(lb.emitter.listener_count(), 0);
}

#[tokio::test]
async fn test_close_interrupts_subscription_waiting_for_broker() {
    let lb = loopback("Queue", 2_000).await;
    let (listener, _) = recorder();

    lb.broker.stop();
    let remote = Arc::clone(&lb.remote);
    let adding = tokio::spawn(async move {
        remote
            .add_notification_listener(&name(EMITTER), listener, None, None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), lb.client.close())
        .await
        .expect("close waited for the broker")
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), adding)
        .await
        .expect("subscription still waiting after close")
        .unwrap();
    assert!(matches!(result, Err(Error::Interrupted)), "{:?}", result);

    lb.broker.start();
    lb.shutdown().await;
}
