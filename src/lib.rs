//! mqmx - remote resource management over message queues
//!
//! Tunnels a management protocol (attribute access, operation invocation,
//! resource discovery and notification subscription) across a message
//! queue transport. Requests are correlated with per-request temporary
//! reply destinations, notifications are relayed to subscriber reply
//! channels, and broker outages are ridden out by reconnecting and
//! re-subscribing.

pub mod client;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use client::{ClientRelay, RemoteResourceServer, RequestInvoker};
pub use codec::{Envelope, JsonCodec, MessageCodec};
pub use config::{Config, Credentials, InitialEnvironment, ServiceUrl};
pub use connector::{ConnectorClient, ConnectorServer};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use registry::{LocalRegistry, ManagementError, ObjectName, ResourceServer};
pub use server::{ServerRelay, ServiceDispatcher};
pub use supervisor::ConnectionSupervisor;
pub use transport::{MemoryBroker, MemoryProvider};
