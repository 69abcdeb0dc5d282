//! Connector Module
//!
//! Lifecycle wrappers tying the pieces together. `ConnectorClient` goes
//! Fresh, Connected, Closed and announces each transition to its
//! connection notification listeners; `ConnectorServer` goes Fresh,
//! Started, Stopped. Closed and Stopped are final.

mod client;
mod server;


pub use client::{ClientState, ConnectorClient};
pub use server::{ConnectorServer, ServerState};

/// Notification type sent when a client connector connects
pub const CONNECTION_OPENED: &str = "mqmx.connection.opened";
/// Notification type sent when a client connector closes
pub const CONNECTION_CLOSED: &str = "mqmx.connection.closed";
