//! Transport Layer
//!
//! Capability interface implemented once per message-queue backend. The
//! supervisor, invoker, dispatcher and relays only ever see these traits;
//! `memory` provides an in-process broker used by the CLI and the tests.

pub mod memory;


use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, Credentials};

pub use memory::{MemoryBroker, MemoryProvider};

/// String property carrying the reply channel name, for transports that
/// cannot propagate a native reply-to header.
pub const REPLY_TO_PROPERTY: &str = "mqmx-reply-to";

/// Transport error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable or not accepting connections
    Unavailable(String),
    /// Operation on a connection that was closed or lost
    ConnectionClosed,
    /// The connection failed underneath us
    ConnectionFailed(String),
    /// Credentials rejected by the broker
    Authentication(String),
    /// Another live connection already uses this client id
    InvalidClientId(String),
    /// The destination does not exist (deleted temporary destination)
    DestinationNotFound(String),
    /// The destination cannot be used for this operation
    InvalidDestination(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "broker unavailable: {}", msg),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            Self::Authentication(msg) => write!(f, "authentication failed: {}", msg),
            Self::InvalidClientId(id) => write!(f, "client id '{}' already in use", id),
            Self::DestinationNotFound(name) => write!(f, "destination not found: {}", name),
            Self::InvalidDestination(msg) => write!(f, "invalid destination: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Broadcast (topic) or point-to-point (queue) delivery.
///
/// Everything that differs between the two kinds is decided here: which
/// temporary destination a requester creates for its replies, and how a
/// destination name received from the other side is turned back into a
/// destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DestinationKind {
    /// One consumer receives each message
    Queue,
    /// Every active consumer receives each message
    #[default]
    Topic,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "Queue",
            Self::Topic => "Topic",
        }
    }

    /// Create a reply channel of the same kind on `session`.
    pub async fn create_reply_channel(
        self,
        session: &dyn Session,
    ) -> Result<Destination, TransportError> {
        match self {
            Self::Queue => session.create_temporary_queue().await,
            Self::Topic => session.create_temporary_topic().await,
        }
    }

    /// Resolve a destination of this kind by name.
    pub async fn resolve(
        self,
        session: &dyn Session,
        name: &str,
    ) -> Result<Destination, TransportError> {
        match self {
            Self::Queue => session.create_queue(name).await,
            Self::Topic => session.create_topic(name).await,
        }
    }

    /// Where the reply to `message` should go.
    ///
    /// Prefers the native reply-to and falls back to the
    /// [`REPLY_TO_PROPERTY`] name, resolved as this kind.
    pub async fn reply_destination(
        self,
        session: &dyn Session,
        message: &Message,
    ) -> Result<Option<Destination>, TransportError> {
        if let Some(reply_to) = &message.reply_to {
            return Ok(Some(reply_to.clone()));
        }
        match message.property(REPLY_TO_PROPERTY) {
            Some(name) if !name.is_empty() => self.resolve(session, name).await.map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("queue") {
            Ok(Self::Queue)
        } else if s.eq_ignore_ascii_case("topic") {
            Ok(Self::Topic)
        } else {
            Err(ConfigError::Validation(format!(
                "destination kind must be Queue or Topic, got '{}'",
                s
            )))
        }
    }
}

/// A named message channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.as_str().to_ascii_lowercase(), self.name)
    }
}

/// A text message with an optional reply-to and string properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: String,
    pub reply_to: Option<Destination>,
    pub properties: BTreeMap<String, String>,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set the native reply-to and mirror its name into
    /// [`REPLY_TO_PROPERTY`].
    pub fn set_reply_to(&mut self, destination: &Destination) {
        self.properties
            .insert(REPLY_TO_PROPERTY.to_string(), destination.name.clone());
        self.reply_to = Some(destination.clone());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

/// Invoked by the transport when a connection fails. Runs on whatever
/// context the transport detects the failure in; must not block.
pub type FailureListener = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Creates transports for the URL protocols it understands.
pub trait TransportProvider: Send + Sync {
    /// URL protocols served by this provider (e.g. `memory`)
    fn protocols(&self) -> Vec<&'static str>;

    /// Build a transport for `broker_uri` (query already stripped of mqmx keys)
    fn create_transport(&self, broker_uri: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connection factory for one broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The broker URI handed to this transport
    fn broker_uri(&self) -> &str;

    /// Open a physical connection, authenticated when `credentials` is set
    async fn connect(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Replace the listener notified when this connection fails
    fn set_failure_listener(&self, listener: FailureListener);

    async fn create_session(&self) -> Result<Arc<dyn Session>, TransportError>;

    /// Close the connection and everything created through it
    async fn close(&self);
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn create_queue(&self, name: &str) -> Result<Destination, TransportError>;

    async fn create_topic(&self, name: &str) -> Result<Destination, TransportError>;

    async fn create_temporary_queue(&self) -> Result<Destination, TransportError>;

    async fn create_temporary_topic(&self) -> Result<Destination, TransportError>;

    async fn delete_temporary(&self, destination: &Destination) -> Result<(), TransportError>;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn Producer>, TransportError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn Consumer>, TransportError>;

    /// Close the session and the consumers created through it
    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send {
    /// Next message, or `None` once the consumer, its session or its
    /// connection is gone
    async fn receive(&mut self) -> Option<Message>;

    async fn close(&mut self);
}
