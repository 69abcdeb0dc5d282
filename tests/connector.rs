//! Connector Lifecycle Tests
//!
//! Lifecycle properties of client and server connectors, and connectors
//! built from a configuration file.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};

use common::{broker, name, url, COUNTER};
use mqmx::config::{Config, InitialEnvironment};
use mqmx::connector::{ClientState, ServerState, CONNECTION_CLOSED, CONNECTION_OPENED};
use mqmx::registry::sample::Counter;
use mqmx::registry::{LocalRegistry, Notification, NotificationListener};
use mqmx::{ConnectorClient, ConnectorServer, Error, MemoryBroker, MemoryProvider};

#[derive(Debug, Clone, Copy)]
enum Op {
    Connect,
    Close,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Connect), Just(Op::Close)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Whatever the call order: at most one "opened" then at most one
    // "closed", and nothing after close succeeds.
    #[test]
    fn prop_client_lifecycle(ops in proptest::collection::vec(op_strategy(), 1..8)) {
        let outcome: Result<(), TestCaseError> = tokio_test::block_on(async {
            let (_broker, provider) = broker();
            let client = ConnectorClient::new(&url("Queue", 500), InitialEnvironment::new(), provider).unwrap();
            let kinds = Arc::new(Mutex::new(Vec::new()));
            let sink = kinds.clone();
            let listener: Arc<dyn NotificationListener> =
                Arc::new(move |n: &Notification, _h: Option<&Value>| sink.lock().push(n.kind.clone()));
            client.add_connection_notification_listener(listener, None, None);

            let mut connected = false;
            let mut closed = false;
            for op in &ops {
                match op {
                    Op::Connect => {
                        let result = client.connect().await;
                        if closed {
                            prop_assert!(matches!(result, Err(Error::AlreadyClosed)));
                        } else {
                            prop_assert!(result.is_ok());
                            connected = true;
                        }
                    }
                    Op::Close => {
                        prop_assert!(client.close().await.is_ok());
                        closed = true;
                    }
                }
            }

            let mut expected = Vec::new();
            if connected {
                expected.push(CONNECTION_OPENED.to_string());
                if closed {
                    expected.push(CONNECTION_CLOSED.to_string());
                }
            }
            prop_assert_eq!(kinds.lock().clone(), expected);

            let state = client.state().await;
            let expected_state = match (connected, closed) {
                (_, true) => ClientState::Closed,
                (true, false) => ClientState::Connected,
                (false, false) => ClientState::Fresh,
            };
            prop_assert_eq!(state, expected_state);
            client.close().await.unwrap();
            Ok(())
        });
        outcome?;
    }

    #[test]
    fn prop_server_lifecycle(ops in proptest::collection::vec(any::<bool>(), 1..8)) {
        let outcome: Result<(), TestCaseError> = tokio_test::block_on(async {
            let (_broker, provider) = broker();
            let server = ConnectorServer::new(
                &url("Queue", 500),
                InitialEnvironment::new(),
                provider,
                Arc::new(LocalRegistry::new("mqmx")),
            )
            .unwrap();

            let mut started = false;
            let mut stopped = false;
            for start in &ops {
                if *start {
                    let result = server.start().await;
                    if stopped {
                        prop_assert!(matches!(result, Err(Error::AlreadyStopped)));
                    } else {
                        prop_assert!(result.is_ok());
                        started = true;
                    }
                } else {
                    prop_assert!(server.stop().await.is_ok());
                    stopped = true;
                }
            }

            let expected = match (started, stopped) {
                (_, true) => ServerState::Stopped,
                (true, false) => ServerState::Started,
                (false, false) => ServerState::Fresh,
            };
            prop_assert_eq!(server.state().await, expected);
            server.stop().await.unwrap();
            Ok(())
        });
        outcome?;
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_connectors_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[log]
level = "debug"

[connector]
url = "service:mqmx:memory:///secured?destination-name=svc"

[connector.attributes]
destination-kind = "Topic"
retry-interval-ms = "20"
timeout-ms = "2000"

[connector.credentials]
username = "admin"
password = "secret"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.log.level, "debug");
    let initial = config.connector.initial_environment();
    assert_eq!(
        initial.credentials.as_ref().map(|c| c.username.as_str()),
        Some("admin")
    );

    let broker = MemoryBroker::new("secured").with_credentials("admin", "secret");
    let provider = Arc::new(MemoryProvider::new().with_broker(broker.clone()));
    let registry = LocalRegistry::new("mqmx");
    registry
        .register(name(COUNTER), Arc::new(Counter::new("hits")))
        .unwrap();

    let server = ConnectorServer::new(
        &config.connector.url,
        initial.clone(),
        provider.clone(),
        Arc::new(registry),
    )
    .unwrap();
    server.start().await.unwrap();
    assert_eq!(
        server.attributes().get("destination-kind").map(String::as_str),
        Some("Topic")
    );

    let client = ConnectorClient::new(&config.connector.url, initial, provider).unwrap();
    client.connect().await.unwrap();
    let remote = client.resource_server().await.unwrap();
    let total = remote
        .invoke(&name(COUNTER), "increment", vec![], vec![])
        .await
        .unwrap();
    assert_eq!(total, json!(1));

    client.close().await.unwrap();
    server.stop().await.unwrap();
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_wrong_credentials_keep_retrying_until_close() {
    let broker = MemoryBroker::new("local").with_credentials("admin", "secret");
    let provider = Arc::new(MemoryProvider::new().with_broker(broker));
    let client = Arc::new(
        ConnectorClient::new(
            &format!("{}&broker-username=admin&broker-password=wrong", url("Queue", 500)),
            InitialEnvironment::new(),
            provider,
        )
        .unwrap(),
    );
    client.connect().await.unwrap();
    let remote = client.resource_server().await.unwrap();

    let call = tokio::spawn(async move { remote.resource_count().await });
    let metrics = client.metrics().clone();
    common::wait_until(Duration::from_secs(5), || {
        metrics.connection_attempts.get() >= 2
    })
    .await;
    assert_eq!(metrics.connections_established.get(), 0);

    client.close().await.unwrap();
    let result = call.await.unwrap();
    assert!(matches!(result, Err(Error::Interrupted)), "{:?}", result);
}

#[tokio::test]
async fn test_stop_interrupts_start_waiting_for_broker() {
    let (broker, provider) = broker();
    broker.stop();
    let server = Arc::new(
        ConnectorServer::new(
            &url("Queue", 500),
            InitialEnvironment::new(),
            provider,
            Arc::new(LocalRegistry::new("mqmx")),
        )
        .unwrap(),
    );

    let starting = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    let metrics = server.metrics().clone();
    common::wait_until(Duration::from_secs(5), || {
        metrics.connection_attempts.get() >= 2
    })
    .await;
    assert_eq!(server.state().await, ServerState::Fresh);

    tokio::time::timeout(Duration::from_secs(3), server.stop())
        .await
        .expect("stop waited for the broker")
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), starting)
        .await
        .expect("start still waiting after stop")
        .unwrap();
    assert!(matches!(result, Err(Error::Interrupted)), "{:?}", result);
    assert_eq!(server.state().await, ServerState::Stopped);
    assert!(matches!(server.start().await, Err(Error::AlreadyStopped)));

    broker.start();
    assert_eq!(broker.connection_count(), 0);
}
