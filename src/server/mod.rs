//! Server Module
//!
//! The serving side: `ServiceDispatcher` answers requests arriving on the
//! service destination, executing them against a `ServerRelay`, which
//! wraps the served registry and forwards its notifications to remote
//! subscribers.

mod dispatcher;
mod relay;


pub use dispatcher::ServiceDispatcher;
pub use relay::{ServerRelay, SUBSCRIBE_RETRY_INTERVAL};
