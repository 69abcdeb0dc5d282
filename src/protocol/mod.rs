//! Remote Management Protocol
//!
//! The requests a client may tunnel to a remote registry, the result that
//! travels back, and `execute`, which runs a request against a registry on
//! the serving side.


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::registry::{Attribute, ManagementError, ObjectName, ResourceServer};
use crate::transport::Destination;

/// A registry method call plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
pub enum Request {
    GetAttribute {
        name: ObjectName,
        attribute: String,
    },
    GetAttributes {
        name: ObjectName,
        attributes: Vec<String>,
    },
    SetAttribute {
        name: ObjectName,
        attribute: Attribute,
    },
    SetAttributes {
        name: ObjectName,
        attributes: Vec<Attribute>,
    },
    Invoke {
        name: ObjectName,
        operation: String,
        params: Vec<Value>,
        signature: Vec<String>,
    },
    QueryNames {
        pattern: Option<ObjectName>,
    },
    QueryResources {
        pattern: Option<ObjectName>,
    },
    GetObjectInstance {
        name: ObjectName,
    },
    IsRegistered {
        name: ObjectName,
    },
    GetResourceCount,
    GetResourceInfo {
        name: ObjectName,
    },
    IsInstanceOf {
        name: ObjectName,
        type_name: String,
    },
    GetDefaultDomain,
    GetDomains,
    Unregister {
        name: ObjectName,
    },
    /// Forward notifications of `name` to `reply_to`, tagged with `listener_id`
    AddRelayListener {
        listener_id: String,
        name: ObjectName,
        reply_to: Destination,
    },
    RemoveRelayListener {
        listener_id: String,
    },
}

impl Request {
    /// Wire name of the method, used in logs
    pub fn method_name(&self) -> &'static str {
        match self {
            Request::GetAttribute { .. } => "getAttribute",
            Request::GetAttributes { .. } => "getAttributes",
            Request::SetAttribute { .. } => "setAttribute",
            Request::SetAttributes { .. } => "setAttributes",
            Request::Invoke { .. } => "invoke",
            Request::QueryNames { .. } => "queryNames",
            Request::QueryResources { .. } => "queryResources",
            Request::GetObjectInstance { .. } => "getObjectInstance",
            Request::IsRegistered { .. } => "isRegistered",
            Request::GetResourceCount => "getResourceCount",
            Request::GetResourceInfo { .. } => "getResourceInfo",
            Request::IsInstanceOf { .. } => "isInstanceOf",
            Request::GetDefaultDomain => "getDefaultDomain",
            Request::GetDomains => "getDomains",
            Request::Unregister { .. } => "unregister",
            Request::AddRelayListener { .. } => "addRelayListener",
            Request::RemoveRelayListener { .. } => "removeRelayListener",
        }
    }
}

/// Outcome of a request: the returned value or the registry's failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "camelCase")]
pub enum InvocationResult {
    Value(Value),
    Exception(ManagementError),
}

impl InvocationResult {
    pub fn into_result(self) -> Result<Value> {
        match self {
            InvocationResult::Value(value) => Ok(value),
            InvocationResult::Exception(e) => Err(Error::Management(e)),
        }
    }
}

/// A registry that can also forward its notifications over the transport.
///
/// Implemented by the server relay (locally) and by the client proxy
/// (remotely, by tunnelling the two relay requests).
#[async_trait]
pub trait RelayedResourceServer: ResourceServer {
    async fn add_relay_listener(
        &self,
        listener_id: &str,
        name: &ObjectName,
        reply_to: &Destination,
    ) -> Result<()>;

    /// Unknown ids are ignored
    async fn remove_relay_listener(&self, listener_id: &str) -> Result<()>;
}

fn to_value<T: Serialize>(result: Result<T>) -> Result<Value> {
    let value = result?;
    serde_json::to_value(value)
        .map_err(|e| Error::Management(ManagementError::NotSerializable(e.to_string())))
}

/// Run `request` against `target`.
///
/// Never fails: any error, including a result that cannot be serialized,
/// becomes an [`InvocationResult::Exception`].
pub async fn execute(target: &dyn RelayedResourceServer, request: Request) -> InvocationResult {
    let result = match request {
        Request::GetAttribute { name, attribute } => {
            to_value(target.get_attribute(&name, &attribute).await)
        }
        Request::GetAttributes { name, attributes } => {
            to_value(target.get_attributes(&name, &attributes).await)
        }
        Request::SetAttribute { name, attribute } => {
            to_value(target.set_attribute(&name, attribute).await)
        }
        Request::SetAttributes { name, attributes } => {
            to_value(target.set_attributes(&name, attributes).await)
        }
        Request::Invoke {
            name,
            operation,
            params,
            signature,
        } => to_value(target.invoke(&name, &operation, params, signature).await),
        Request::QueryNames { pattern } => to_value(target.query_names(pattern.as_ref()).await),
        Request::QueryResources { pattern } => {
            to_value(target.query_resources(pattern.as_ref()).await)
        }
        Request::GetObjectInstance { name } => to_value(target.object_instance(&name).await),
        Request::IsRegistered { name } => to_value(target.is_registered(&name).await),
        Request::GetResourceCount => to_value(target.resource_count().await),
        Request::GetResourceInfo { name } => to_value(target.resource_info(&name).await),
        Request::IsInstanceOf { name, type_name } => {
            to_value(target.is_instance_of(&name, &type_name).await)
        }
        Request::GetDefaultDomain => to_value(target.default_domain().await),
        Request::GetDomains => to_value(target.domains().await),
        Request::Unregister { name } => to_value(target.unregister(&name).await),
        Request::AddRelayListener {
            listener_id,
            name,
            reply_to,
        } => to_value(
            target
                .add_relay_listener(&listener_id, &name, &reply_to)
                .await,
        ),
        Request::RemoveRelayListener { listener_id } => {
            to_value(target.remove_relay_listener(&listener_id).await)
        }
    };

    match result {
        Ok(value) => InvocationResult::Value(value),
        Err(e) => InvocationResult::Exception(e.into_management()),
    }
}
