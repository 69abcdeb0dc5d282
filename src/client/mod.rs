//! Client Module
//!
//! The requesting side: `RequestInvoker` performs one request/reply
//! exchange per call, `RemoteResourceServer` maps the registry interface
//! onto requests, and `ClientRelay` adds notification listeners on top.

mod invoker;
mod proxy;
mod relay;

pub use invoker::RequestInvoker;
pub use proxy::RemoteResourceServer;
pub use relay::ClientRelay;
