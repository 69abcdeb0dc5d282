//! In-Memory Broker
//!
//! A process-local broker implementing the transport capability traits.
//! Queues deliver round-robin and keep a backlog while nobody consumes;
//! topics fan out to every live consumer and drop otherwise. Temporary
//! destinations belong to the connection that created them.
//!
//! `stop()` simulates a broker outage: every connection's failure listener
//! fires, then all consumers see end-of-stream. `start()` accepts
//! connections again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Connection, Consumer, Destination, DestinationKind, FailureListener, Message, Producer,
    Session, Transport, TransportError, TransportProvider,
};
use crate::config::Credentials;

const TEMP_QUEUE_PREFIX: &str = "temp-queue://";
const TEMP_TOPIC_PREFIX: &str = "temp-topic://";

fn is_temporary(destination: &Destination) -> bool {
    destination.name.starts_with(TEMP_QUEUE_PREFIX) || destination.name.starts_with(TEMP_TOPIC_PREFIX)
}

struct ConsumerSlot {
    id: u64,
    connection: u64,
    session: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct DestinationState {
    consumers: Vec<ConsumerSlot>,
    backlog: VecDeque<Message>,
    cursor: usize,
    owner: Option<u64>,
}

struct ConnectionRecord {
    client_id: Option<String>,
    failure_listener: Option<FailureListener>,
}

struct BrokerState {
    running: bool,
    credentials: Option<Credentials>,
    destinations: HashMap<Destination, DestinationState>,
    connections: HashMap<u64, ConnectionRecord>,
}

struct BrokerInner {
    name: String,
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    strip_reply_to: AtomicBool,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_live(state: &BrokerState, connection: u64) -> Result<(), TransportError> {
        if state.running && state.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    fn connect(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<u64, TransportError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(TransportError::Unavailable(format!(
                "broker '{}' is not running",
                self.name
            )));
        }
        if let Some(expected) = &state.credentials {
            match credentials {
                Some(given) if given == expected => {}
                Some(given) => {
                    return Err(TransportError::Authentication(format!(
                        "user '{}' rejected",
                        given.username
                    )))
                }
                None => {
                    return Err(TransportError::Authentication(
                        "anonymous connections are not allowed".to_string(),
                    ))
                }
            }
        }
        if let Some(id) = client_id {
            let in_use = state
                .connections
                .values()
                .any(|c| c.client_id.as_deref() == Some(id));
            if in_use {
                return Err(TransportError::InvalidClientId(id.to_string()));
            }
        }

        let id = self.next_id();
        state.connections.insert(
            id,
            ConnectionRecord {
                client_id: client_id.map(str::to_string),
                failure_listener: None,
            },
        );
        debug!("Broker '{}': connection {} opened", self.name, id);
        Ok(id)
    }

    fn close_connection(&self, connection: u64) {
        let mut state = self.state.lock();
        if state.connections.remove(&connection).is_none() {
            return;
        }
        state.destinations.retain(|_, dest| {
            dest.consumers.retain(|slot| slot.connection != connection);
            dest.owner != Some(connection)
        });
        debug!("Broker '{}': connection {} closed", self.name, connection);
    }

    fn close_session(&self, session: u64) {
        let mut state = self.state.lock();
        for dest in state.destinations.values_mut() {
            dest.consumers.retain(|slot| slot.session != session);
        }
    }

    fn remove_consumer(&self, destination: &Destination, consumer: u64) {
        let mut state = self.state.lock();
        if let Some(dest) = state.destinations.get_mut(destination) {
            dest.consumers.retain(|slot| slot.id != consumer);
        }
    }

    fn route(&self, connection: u64, destination: &Destination, mut message: Message) -> Result<(), TransportError> {
        if self.strip_reply_to.load(Ordering::Relaxed) {
            message.reply_to = None;
        }

        let mut state = self.state.lock();
        Self::ensure_live(&state, connection)?;

        if is_temporary(destination) && !state.destinations.contains_key(destination) {
            return Err(TransportError::DestinationNotFound(destination.name.clone()));
        }
        let dest = state.destinations.entry(destination.clone()).or_default();

        match destination.kind {
            DestinationKind::Queue => {
                while !dest.consumers.is_empty() {
                    let index = dest.cursor % dest.consumers.len();
                    match dest.consumers[index].tx.send(message) {
                        Ok(()) => {
                            dest.cursor = index + 1;
                            return Ok(());
                        }
                        Err(mpsc::error::SendError(returned)) => {
                            dest.consumers.remove(index);
                            message = returned;
                        }
                    }
                }
                trace!("Broker '{}': queued message on {}", self.name, destination);
                dest.backlog.push_back(message);
            }
            DestinationKind::Topic => {
                dest.consumers
                    .retain(|slot| slot.tx.send(message.clone()).is_ok());
            }
        }
        Ok(())
    }
}

/// Process-local message broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create a running broker
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.into(),
                state: Mutex::new(BrokerState {
                    running: true,
                    credentials: None,
                    destinations: HashMap::new(),
                    connections: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                strip_reply_to: AtomicBool::new(false),
            }),
        }
    }

    /// Only accept connections presenting these credentials
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner.state.lock().credentials = Some(Credentials::new(username, password));
        self
    }

    /// Drop native reply-to headers in transit, as some transports do
    pub fn set_strip_reply_to(&self, strip: bool) {
        self.inner.strip_reply_to.store(strip, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Simulate an outage: fail every connection and forget all state.
    pub fn stop(&self) {
        let (connections, destinations) = {
            let mut state = self.inner.state.lock();
            state.running = false;
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.destinations),
            )
        };

        debug!(
            "Broker '{}': stopping, failing {} connections",
            self.inner.name,
            connections.len()
        );
        let error = TransportError::ConnectionFailed(format!("broker '{}' stopped", self.inner.name));
        for record in connections.values() {
            if let Some(listener) = &record.failure_listener {
                listener(&error);
            }
        }
        // Consumers observe end-of-stream only after the listeners ran.
        drop(destinations);
    }

    pub fn start(&self) {
        self.inner.state.lock().running = true;
        debug!("Broker '{}': started", self.inner.name);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn temporary_destination_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .destinations
            .keys()
            .filter(|d| is_temporary(d))
            .count()
    }

    pub fn consumer_count(&self, destination: &Destination) -> usize {
        self.inner
            .state
            .lock()
            .destinations
            .get(destination)
            .map(|d| d.consumers.len())
            .unwrap_or(0)
    }

    /// Transport connecting to this broker, as if reached through `broker_uri`
    pub fn transport(&self, broker_uri: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.inner.clone(),
            broker_uri: broker_uri.into(),
        }
    }
}

/// Serves the `memory` URL protocol from a set of named brokers.
///
/// The transport URI's path (before any query) names the broker.
#[derive(Default)]
pub struct MemoryProvider {
    brokers: DashMap<String, MemoryBroker>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(self, broker: MemoryBroker) -> Self {
        self.register(broker);
        self
    }

    pub fn register(&self, broker: MemoryBroker) {
        self.brokers.insert(broker.name().to_string(), broker);
    }
}

impl TransportProvider for MemoryProvider {
    fn protocols(&self) -> Vec<&'static str> {
        vec!["memory"]
    }

    fn create_transport(&self, broker_uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let name = broker_uri.split('?').next().unwrap_or(broker_uri);
        let broker = self.brokers.get(name).ok_or_else(|| {
            TransportError::Unavailable(format!("no in-memory broker named '{}'", name))
        })?;
        Ok(Arc::new(broker.transport(broker_uri)))
    }
}

pub struct MemoryTransport {
    broker: Arc<BrokerInner>,
    broker_uri: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn broker_uri(&self) -> &str {
        &self.broker_uri
    }

    async fn connect(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let id = self.broker.connect(credentials, client_id)?;
        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn set_failure_listener(&self, listener: FailureListener) {
        if let Some(record) = self.broker.state.lock().connections.get_mut(&self.id) {
            record.failure_listener = Some(listener);
        }
    }

    async fn create_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        BrokerInner::ensure_live(&self.broker.state.lock(), self.id)?;
        Ok(Arc::new(MemorySession {
            id: self.broker.next_id(),
            connection: self.id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) {
        self.broker.close_connection(self.id);
    }
}

struct MemorySession {
    id: u64,
    connection: u64,
    broker: Arc<BrokerInner>,
}

impl MemorySession {
    fn create_temporary(&self, kind: DestinationKind) -> Result<Destination, TransportError> {
        let mut state = self.broker.state.lock();
        BrokerInner::ensure_live(&state, self.connection)?;
        let prefix = match kind {
            DestinationKind::Queue => TEMP_QUEUE_PREFIX,
            DestinationKind::Topic => TEMP_TOPIC_PREFIX,
        };
        let destination = Destination::new(
            kind,
            format!("{}{}:{}", prefix, self.broker.name, self.broker.next_id()),
        );
        state.destinations.insert(
            destination.clone(),
            DestinationState {
                owner: Some(self.connection),
                ..Default::default()
            },
        );
        Ok(destination)
    }

    fn named(&self, kind: DestinationKind, name: &str) -> Result<Destination, TransportError> {
        if name.is_empty() {
            return Err(TransportError::InvalidDestination(
                "destination name is empty".to_string(),
            ));
        }
        BrokerInner::ensure_live(&self.broker.state.lock(), self.connection)?;
        Ok(Destination::new(kind, name))
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_queue(&self, name: &str) -> Result<Destination, TransportError> {
        self.named(DestinationKind::Queue, name)
    }

    async fn create_topic(&self, name: &str) -> Result<Destination, TransportError> {
        self.named(DestinationKind::Topic, name)
    }

    async fn create_temporary_queue(&self) -> Result<Destination, TransportError> {
        self.create_temporary(DestinationKind::Queue)
    }

    async fn create_temporary_topic(&self) -> Result<Destination, TransportError> {
        self.create_temporary(DestinationKind::Topic)
    }

    async fn delete_temporary(&self, destination: &Destination) -> Result<(), TransportError> {
        if !is_temporary(destination) {
            return Err(TransportError::InvalidDestination(format!(
                "{} is not temporary",
                destination
            )));
        }
        let mut state = self.broker.state.lock();
        BrokerInner::ensure_live(&state, self.connection)?;
        state
            .destinations
            .remove(destination)
            .map(|_| ())
            .ok_or_else(|| TransportError::DestinationNotFound(destination.name.clone()))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn Producer>, TransportError> {
        BrokerInner::ensure_live(&self.broker.state.lock(), self.connection)?;
        Ok(Box::new(MemoryProducer {
            connection: self.connection,
            destination: destination.clone(),
            broker: self.broker.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        let mut state = self.broker.state.lock();
        BrokerInner::ensure_live(&state, self.connection)?;
        if is_temporary(destination) && !state.destinations.contains_key(destination) {
            return Err(TransportError::DestinationNotFound(destination.name.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.broker.next_id();
        let dest = state.destinations.entry(destination.clone()).or_default();
        if destination.kind == DestinationKind::Queue {
            for message in dest.backlog.drain(..) {
                let _ = tx.send(message);
            }
        }
        dest.consumers.push(ConsumerSlot {
            id,
            connection: self.connection,
            session: self.id,
            tx,
        });

        Ok(Box::new(MemoryConsumer {
            id,
            destination: destination.clone(),
            rx,
            broker: self.broker.clone(),
            closed: false,
        }))
    }

    async fn close(&self) {
        self.broker.close_session(self.id);
    }
}

struct MemoryProducer {
    connection: u64,
    destination: Destination,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.broker.route(self.connection, &self.destination, message)
    }

    async fn close(&self) {}
}

struct MemoryConsumer {
    id: u64,
    destination: Destination,
    rx: mpsc::UnboundedReceiver<Message>,
    broker: Arc<BrokerInner>,
    closed: bool,
}

impl MemoryConsumer {
    fn detach(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx.close();
            self.broker.remove_consumer(&self.destination, self.id);
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.detach();
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.detach();
    }
}
