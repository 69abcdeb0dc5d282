//! Registry Module
//!
//! The management model tunnelled over the transport: resource names,
//! attributes, operations and notifications, the `ResourceServer` trait
//! that both the local registry and the remote proxy implement, and an
//! in-process `LocalRegistry` with a couple of sample resources.

mod local;
mod name;
mod notification;
pub mod sample;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use local::{LocalRegistry, ManagedResource};
pub use name::ObjectName;
pub use notification::{
    same_filter, same_listener, Notification, NotificationBroadcaster, NotificationFilter,
    NotificationListener, NotificationSource, OpaqueSource,
};

/// Failures raised by a resource registry. Travels back to remote callers
/// inside reply envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum ManagementError {
    /// No resource registered under the name
    InstanceNotFound(String),
    /// A resource is already registered under the name
    InstanceAlreadyExists(String),
    /// The resource has no such attribute
    AttributeNotFound(String),
    /// The attribute exists but the value was rejected
    InvalidAttributeValue(String),
    /// The resource has no such operation
    OperationNotFound(String),
    /// The operation ran and failed
    OperationFailed(String),
    /// Removing a listener that was never added
    ListenerNotFound(String),
    /// The resource does not emit notifications
    NotBroadcaster(String),
    /// Unparseable resource name
    MalformedObjectName(String),
    /// A result could not be serialized for the reply
    NotSerializable(String),
    /// Anything else that went wrong on the remote side
    Internal(String),
}

impl fmt::Display for ManagementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound(name) => write!(f, "instance not found: {}", name),
            Self::InstanceAlreadyExists(name) => write!(f, "instance already exists: {}", name),
            Self::AttributeNotFound(attr) => write!(f, "attribute not found: {}", attr),
            Self::InvalidAttributeValue(msg) => write!(f, "invalid attribute value: {}", msg),
            Self::OperationNotFound(op) => write!(f, "operation not found: {}", op),
            Self::OperationFailed(msg) => write!(f, "operation failed: {}", msg),
            Self::ListenerNotFound(msg) => write!(f, "listener not found: {}", msg),
            Self::NotBroadcaster(name) => write!(f, "{} does not emit notifications", name),
            Self::MalformedObjectName(msg) => write!(f, "malformed object name: {}", msg),
            Self::NotSerializable(msg) => write!(f, "not serializable: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ManagementError {}

/// A named attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Value,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A registered resource and its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInstance {
    pub name: ObjectName,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub type_name: String,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    pub signature: Vec<String>,
    pub return_type: String,
}

/// Management interface of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub type_name: String,
    pub description: String,
    pub attributes: Vec<AttributeInfo>,
    pub operations: Vec<OperationInfo>,
    /// Notification types the resource may emit
    pub notifications: Vec<String>,
    /// Additional type names `is_instance_of` answers true for
    pub interfaces: Vec<String>,
}

/// Connection to a resource registry, local or remote.
///
/// Every method may fail with [`crate::Error::Management`] carrying the
/// registry's own failure; remote implementations add transport,
/// protocol and timeout failures.
#[async_trait]
pub trait ResourceServer: Send + Sync {
    async fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value>;

    /// Values of the readable attributes among `attributes`; unknown ones
    /// are left out
    async fn get_attributes(&self, name: &ObjectName, attributes: &[String])
        -> Result<Vec<Attribute>>;

    async fn set_attribute(&self, name: &ObjectName, attribute: Attribute) -> Result<()>;

    /// Returns the attributes that were actually set
    async fn set_attributes(
        &self,
        name: &ObjectName,
        attributes: Vec<Attribute>,
    ) -> Result<Vec<Attribute>>;

    /// Invoke `operation` with positional `params`; `signature` names the
    /// parameter types and may be empty
    async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> Result<Value>;

    /// Names matching `pattern`, or every name when `None`, sorted
    async fn query_names(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectName>>;

    async fn query_resources(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectInstance>>;

    async fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance>;

    async fn is_registered(&self, name: &ObjectName) -> Result<bool>;

    async fn resource_count(&self) -> Result<usize>;

    async fn resource_info(&self, name: &ObjectName) -> Result<ResourceInfo>;

    async fn is_instance_of(&self, name: &ObjectName, type_name: &str) -> Result<bool>;

    async fn default_domain(&self) -> Result<String>;

    /// Distinct domains of the registered names, sorted
    async fn domains(&self) -> Result<Vec<String>>;

    async fn unregister(&self, name: &ObjectName) -> Result<()>;

    async fn add_notification_listener(
        &self,
        name: &ObjectName,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) -> Result<()>;

    /// Remove every registration of `listener` on `name`
    ///
    /// # Returns
    /// * `Err(Management(ListenerNotFound))` - the listener was not registered
    async fn remove_notification_listener(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<()>;

    /// Remove the single registration matching listener, filter and handback
    async fn remove_notification_listener_with(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> Result<()>;
}
