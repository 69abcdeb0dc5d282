//! Remote registry proxy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::RequestInvoker;
use crate::error::{Error, Result};
use crate::protocol::{RelayedResourceServer, Request};
use crate::registry::{
    Attribute, NotificationFilter, NotificationListener, ObjectInstance, ObjectName,
    ResourceInfo, ResourceServer,
};
use crate::transport::Destination;

/// [`ResourceServer`] whose every call is tunnelled to a remote registry.
///
/// Local notification listeners are not supported here; wrap the proxy in
/// a [`ClientRelay`](super::ClientRelay) for that.
pub struct RemoteResourceServer {
    invoker: Arc<RequestInvoker>,
}

impl RemoteResourceServer {
    pub fn new(invoker: Arc<RequestInvoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &Arc<RequestInvoker> {
        &self.invoker
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let method = request.method_name();
        let value = self.invoker.invoke(request).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("unexpected {} result: {}", method, e)))
    }
}

#[async_trait]
impl ResourceServer for RemoteResourceServer {
    async fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value> {
        self.call(Request::GetAttribute {
            name: name.clone(),
            attribute: attribute.to_string(),
        })
        .await
    }

    async fn get_attributes(
        &self,
        name: &ObjectName,
        attributes: &[String],
    ) -> Result<Vec<Attribute>> {
        self.call(Request::GetAttributes {
            name: name.clone(),
            attributes: attributes.to_vec(),
        })
        .await
    }

    async fn set_attribute(&self, name: &ObjectName, attribute: Attribute) -> Result<()> {
        self.call(Request::SetAttribute {
            name: name.clone(),
            attribute,
        })
        .await
    }

    async fn set_attributes(
        &self,
        name: &ObjectName,
        attributes: Vec<Attribute>,
    ) -> Result<Vec<Attribute>> {
        self.call(Request::SetAttributes {
            name: name.clone(),
            attributes,
        })
        .await
    }

    async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> Result<Value> {
        self.call(Request::Invoke {
            name: name.clone(),
            operation: operation.to_string(),
            params,
            signature,
        })
        .await
    }

    async fn query_names(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectName>> {
        self.call(Request::QueryNames {
            pattern: pattern.cloned(),
        })
        .await
    }

    async fn query_resources(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectInstance>> {
        self.call(Request::QueryResources {
            pattern: pattern.cloned(),
        })
        .await
    }

    async fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance> {
        self.call(Request::GetObjectInstance { name: name.clone() })
            .await
    }

    async fn is_registered(&self, name: &ObjectName) -> Result<bool> {
        self.call(Request::IsRegistered { name: name.clone() }).await
    }

    async fn resource_count(&self) -> Result<usize> {
        self.call(Request::GetResourceCount).await
    }

    async fn resource_info(&self, name: &ObjectName) -> Result<ResourceInfo> {
        self.call(Request::GetResourceInfo { name: name.clone() })
            .await
    }

    async fn is_instance_of(&self, name: &ObjectName, type_name: &str) -> Result<bool> {
        self.call(Request::IsInstanceOf {
            name: name.clone(),
            type_name: type_name.to_string(),
        })
        .await
    }

    async fn default_domain(&self) -> Result<String> {
        self.call(Request::GetDefaultDomain).await
    }

    async fn domains(&self) -> Result<Vec<String>> {
        self.call(Request::GetDomains).await
    }

    async fn unregister(&self, name: &ObjectName) -> Result<()> {
        self.call(Request::Unregister { name: name.clone() }).await
    }

    async fn add_notification_listener(
        &self,
        _name: &ObjectName,
        _listener: Arc<dyn NotificationListener>,
        _filter: Option<NotificationFilter>,
        _handback: Option<Value>,
    ) -> Result<()> {
        Err(Error::Unsupported("notification listeners need a client relay"))
    }

    async fn remove_notification_listener(
        &self,
        _name: &ObjectName,
        _listener: &Arc<dyn NotificationListener>,
    ) -> Result<()> {
        Err(Error::Unsupported("notification listeners need a client relay"))
    }

    async fn remove_notification_listener_with(
        &self,
        _name: &ObjectName,
        _listener: &Arc<dyn NotificationListener>,
        _filter: Option<&NotificationFilter>,
        _handback: Option<&Value>,
    ) -> Result<()> {
        Err(Error::Unsupported("notification listeners need a client relay"))
    }
}

#[async_trait]
impl RelayedResourceServer for RemoteResourceServer {
    async fn add_relay_listener(
        &self,
        listener_id: &str,
        name: &ObjectName,
        reply_to: &Destination,
    ) -> Result<()> {
        self.call(Request::AddRelayListener {
            listener_id: listener_id.to_string(),
            name: name.clone(),
            reply_to: reply_to.clone(),
        })
        .await
    }

    async fn remove_relay_listener(&self, listener_id: &str) -> Result<()> {
        self.call(Request::RemoveRelayListener {
            listener_id: listener_id.to_string(),
        })
        .await
    }
}
