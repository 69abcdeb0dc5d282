//! In-process resource registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::{
    Attribute, ManagementError, NotificationBroadcaster, NotificationFilter,
    NotificationListener, ObjectInstance, ObjectName, ResourceInfo, ResourceServer,
};
use crate::error::Result;

/// A resource that can be registered in a [`LocalRegistry`].
pub trait ManagedResource: Send + Sync {
    fn info(&self) -> ResourceInfo;

    fn get_attribute(&self, attribute: &str) -> std::result::Result<Value, ManagementError>;

    fn set_attribute(&self, attribute: &Attribute) -> std::result::Result<(), ManagementError> {
        Err(ManagementError::AttributeNotFound(attribute.name.clone()))
    }

    fn invoke(
        &self,
        operation: &str,
        params: &[Value],
        signature: &[String],
    ) -> std::result::Result<Value, ManagementError>;

    /// Present when the resource emits notifications
    fn broadcaster(&self) -> Option<&NotificationBroadcaster> {
        None
    }
}

/// Registry of resources living in this process.
pub struct LocalRegistry {
    default_domain: String,
    resources: DashMap<ObjectName, Arc<dyn ManagedResource>>,
}

impl LocalRegistry {
    pub fn new(default_domain: impl Into<String>) -> Self {
        Self {
            default_domain: default_domain.into(),
            resources: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        name: ObjectName,
        resource: Arc<dyn ManagedResource>,
    ) -> std::result::Result<ObjectInstance, ManagementError> {
        if name.is_pattern() {
            return Err(ManagementError::MalformedObjectName(format!(
                "cannot register under pattern {}",
                name
            )));
        }
        let type_name = resource.info().type_name;
        match self.resources.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ManagementError::InstanceAlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(resource);
                debug!("Registered {} ({})", name, type_name);
                Ok(ObjectInstance { name, type_name })
            }
        }
    }

    fn lookup(&self, name: &ObjectName) -> std::result::Result<Arc<dyn ManagedResource>, ManagementError> {
        self.resources
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagementError::InstanceNotFound(name.to_string()))
    }

    fn matching(&self, pattern: Option<&ObjectName>) -> Vec<(ObjectName, Arc<dyn ManagedResource>)> {
        let mut found: Vec<_> = self
            .resources
            .iter()
            .filter(|entry| pattern.map_or(true, |p| p.matches(entry.key())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    fn with_broadcaster<T>(
        &self,
        name: &ObjectName,
        f: impl FnOnce(&NotificationBroadcaster) -> std::result::Result<T, ManagementError>,
    ) -> Result<T> {
        let resource = self.lookup(name)?;
        let broadcaster = resource
            .broadcaster()
            .ok_or_else(|| ManagementError::NotBroadcaster(name.to_string()))?;
        Ok(f(broadcaster)?)
    }
}

#[async_trait]
impl ResourceServer for LocalRegistry {
    async fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value> {
        Ok(self.lookup(name)?.get_attribute(attribute)?)
    }

    async fn get_attributes(
        &self,
        name: &ObjectName,
        attributes: &[String],
    ) -> Result<Vec<Attribute>> {
        let resource = self.lookup(name)?;
        Ok(attributes
            .iter()
            .filter_map(|attr| {
                resource
                    .get_attribute(attr)
                    .ok()
                    .map(|value| Attribute::new(attr.clone(), value))
            })
            .collect())
    }

    async fn set_attribute(&self, name: &ObjectName, attribute: Attribute) -> Result<()> {
        Ok(self.lookup(name)?.set_attribute(&attribute)?)
    }

    async fn set_attributes(
        &self,
        name: &ObjectName,
        attributes: Vec<Attribute>,
    ) -> Result<Vec<Attribute>> {
        let resource = self.lookup(name)?;
        Ok(attributes
            .into_iter()
            .filter(|attr| resource.set_attribute(attr).is_ok())
            .collect())
    }

    async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> Result<Value> {
        Ok(self.lookup(name)?.invoke(operation, &params, &signature)?)
    }

    async fn query_names(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectName>> {
        Ok(self.matching(pattern).into_iter().map(|(name, _)| name).collect())
    }

    async fn query_resources(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectInstance>> {
        Ok(self
            .matching(pattern)
            .into_iter()
            .map(|(name, resource)| ObjectInstance {
                name,
                type_name: resource.info().type_name,
            })
            .collect())
    }

    async fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance> {
        let resource = self.lookup(name)?;
        Ok(ObjectInstance {
            name: name.clone(),
            type_name: resource.info().type_name,
        })
    }

    async fn is_registered(&self, name: &ObjectName) -> Result<bool> {
        Ok(self.resources.contains_key(name))
    }

    async fn resource_count(&self) -> Result<usize> {
        Ok(self.resources.len())
    }

    async fn resource_info(&self, name: &ObjectName) -> Result<ResourceInfo> {
        Ok(self.lookup(name)?.info())
    }

    async fn is_instance_of(&self, name: &ObjectName, type_name: &str) -> Result<bool> {
        let info = self.lookup(name)?.info();
        Ok(info.type_name == type_name || info.interfaces.iter().any(|i| i == type_name))
    }

    async fn default_domain(&self) -> Result<String> {
        Ok(self.default_domain.clone())
    }

    async fn domains(&self) -> Result<Vec<String>> {
        let domains: BTreeSet<String> = self
            .resources
            .iter()
            .map(|entry| entry.key().domain().to_string())
            .collect();
        Ok(domains.into_iter().collect())
    }

    async fn unregister(&self, name: &ObjectName) -> Result<()> {
        self.resources
            .remove(name)
            .map(|_| debug!("Unregistered {}", name))
            .ok_or_else(|| ManagementError::InstanceNotFound(name.to_string()).into())
    }

    async fn add_notification_listener(
        &self,
        name: &ObjectName,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) -> Result<()> {
        self.with_broadcaster(name, |b| {
            b.add_listener(listener, filter, handback);
            Ok(())
        })
    }

    async fn remove_notification_listener(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<()> {
        self.with_broadcaster(name, |b| b.remove_listener(listener))
    }

    async fn remove_notification_listener_with(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> Result<()> {
        self.with_broadcaster(name, |b| b.remove_listener_with(listener, filter, handback))
    }
}
