//! Shared fixtures for the loopback integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use mqmx::config::InitialEnvironment;
use mqmx::registry::sample::{Counter, Emitter};
use mqmx::registry::{LocalRegistry, Notification, NotificationListener, ObjectName};
use mqmx::{ConnectorClient, ConnectorServer, MemoryBroker, MemoryProvider, Metrics, ResourceServer};

pub const COUNTER: &str = "mqmx:type=Counter,name=hits";
pub const EMITTER: &str = "events:type=Emitter";

pub fn name(s: &str) -> ObjectName {
    ObjectName::parse(s).unwrap()
}

/// URL for the `local` broker with short timings suited to tests
pub fn url(kind: &str, timeout_ms: u64) -> String {
    format!(
        "service:mqmx:memory:///local?destination-name=svc&destination-kind={}&retry-interval-ms=20&timeout-ms={}",
        kind, timeout_ms
    )
}

pub fn broker() -> (MemoryBroker, Arc<MemoryProvider>) {
    let broker = MemoryBroker::new("local");
    let provider = Arc::new(MemoryProvider::new().with_broker(broker.clone()));
    (broker, provider)
}

/// A started server and a connected client sharing one in-memory broker.
pub struct Loopback {
    pub broker: MemoryBroker,
    pub provider: Arc<MemoryProvider>,
    pub counter: Arc<Counter>,
    pub emitter: Arc<Emitter>,
    pub server: ConnectorServer,
    pub client: ConnectorClient,
    pub server_metrics: Arc<Metrics>,
    pub client_metrics: Arc<Metrics>,
    pub remote: Arc<dyn ResourceServer>,
}

impl Loopback {
    pub async fn shutdown(self) {
        self.client.close().await.unwrap();
        self.server.stop().await.unwrap();
    }
}

pub async fn loopback(kind: &str, timeout_ms: u64) -> Loopback {
    let (broker, provider) = broker();

    let registry = LocalRegistry::new("mqmx");
    let counter = Arc::new(Counter::new("hits"));
    registry.register(name(COUNTER), counter.clone()).unwrap();
    let emitter = Arc::new(Emitter::new(name(EMITTER)));
    registry.register(name(EMITTER), emitter.clone()).unwrap();

    let url = url(kind, timeout_ms);
    let server_metrics = Arc::new(Metrics::new());
    let server = ConnectorServer::new(
        &url,
        InitialEnvironment::new(),
        provider.clone(),
        Arc::new(registry),
    )
    .unwrap()
    .with_metrics(server_metrics.clone());
    server.start().await.unwrap();

    let client_metrics = Arc::new(Metrics::new());
    let client = ConnectorClient::new(&url, InitialEnvironment::new(), provider.clone())
        .unwrap()
        .with_metrics(client_metrics.clone());
    client.connect().await.unwrap();
    let remote = client.resource_server().await.unwrap();

    Loopback {
        broker,
        provider,
        counter,
        emitter,
        server,
        client,
        server_metrics,
        client_metrics,
        remote,
    }
}

pub type Received = Arc<Mutex<Vec<(Notification, Option<Value>)>>>;

/// Listener recording every notification with its handback
pub fn recorder() -> (Arc<dyn NotificationListener>, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let listener: Arc<dyn NotificationListener> =
        Arc::new(move |n: &Notification, handback: Option<&Value>| {
            sink.lock().push((n.clone(), handback.cloned()));
        });
    (listener, received)
}

/// Poll `condition` until it holds; panics after `limit`
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`wait_until`] for async conditions
pub async fn wait_until_async<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
