//! Sample resources used by the demo binary and the tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde_json::{json, Value};

use super::{
    Attribute, AttributeInfo, ManagedResource, ManagementError, Notification,
    NotificationBroadcaster, NotificationSource, ObjectName, OpaqueSource, OperationInfo,
    ResourceInfo,
};

pub const COUNTER_TYPE: &str = "mqmx.sample.Counter";
pub const EMITTER_TYPE: &str = "mqmx.sample.Emitter";
/// Notification type sent by [`Emitter`]
pub const SAMPLE_EVENT: &str = "mqmx.sample.event";

/// Integer counter with a writable `Count` and a read-only `Label`.
pub struct Counter {
    label: String,
    count: AtomicI64,
}

impl Counter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            count: AtomicI64::new(0),
        }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

fn int_param(params: &[Value], index: usize, operation: &str) -> Result<i64, ManagementError> {
    params.get(index).and_then(Value::as_i64).ok_or_else(|| {
        ManagementError::OperationFailed(format!(
            "{} expects an integer argument at position {}",
            operation, index
        ))
    })
}

impl ManagedResource for Counter {
    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            type_name: COUNTER_TYPE.to_string(),
            description: "Integer counter".to_string(),
            attributes: vec![
                AttributeInfo {
                    name: "Count".to_string(),
                    type_name: "long".to_string(),
                    readable: true,
                    writable: true,
                },
                AttributeInfo {
                    name: "Label".to_string(),
                    type_name: "string".to_string(),
                    readable: true,
                    writable: false,
                },
            ],
            operations: vec![
                OperationInfo {
                    name: "increment".to_string(),
                    signature: vec![],
                    return_type: "long".to_string(),
                },
                OperationInfo {
                    name: "add".to_string(),
                    signature: vec!["long".to_string()],
                    return_type: "long".to_string(),
                },
                OperationInfo {
                    name: "reset".to_string(),
                    signature: vec![],
                    return_type: "void".to_string(),
                },
            ],
            notifications: vec![],
            interfaces: vec!["mqmx.sample.CounterMBean".to_string()],
        }
    }

    fn get_attribute(&self, attribute: &str) -> Result<Value, ManagementError> {
        match attribute {
            "Count" => Ok(json!(self.count())),
            "Label" => Ok(json!(self.label)),
            other => Err(ManagementError::AttributeNotFound(other.to_string())),
        }
    }

    fn set_attribute(&self, attribute: &Attribute) -> Result<(), ManagementError> {
        match attribute.name.as_str() {
            "Count" => {
                let value = attribute.value.as_i64().ok_or_else(|| {
                    ManagementError::InvalidAttributeValue(format!(
                        "Count must be an integer, got {}",
                        attribute.value
                    ))
                })?;
                self.count.store(value, Ordering::SeqCst);
                Ok(())
            }
            "Label" => Err(ManagementError::InvalidAttributeValue(
                "Label is read-only".to_string(),
            )),
            other => Err(ManagementError::AttributeNotFound(other.to_string())),
        }
    }

    fn invoke(
        &self,
        operation: &str,
        params: &[Value],
        _signature: &[String],
    ) -> Result<Value, ManagementError> {
        match operation {
            "increment" => Ok(json!(self.count.fetch_add(1, Ordering::SeqCst) + 1)),
            "add" => {
                let delta = int_param(params, 0, operation)?;
                Ok(json!(self.count.fetch_add(delta, Ordering::SeqCst) + delta))
            }
            "reset" => {
                self.count.store(0, Ordering::SeqCst);
                Ok(Value::Null)
            }
            other => Err(ManagementError::OperationNotFound(other.to_string())),
        }
    }
}

/// Emits notifications on demand.
///
/// `emit` sends a forwardable event; `emit_opaque` sends one whose source
/// cannot be serialized.
pub struct Emitter {
    name: ObjectName,
    broadcaster: NotificationBroadcaster,
    emitted: AtomicU64,
}

impl Emitter {
    pub fn new(name: ObjectName) -> Self {
        Self {
            name,
            broadcaster: NotificationBroadcaster::new(),
            emitted: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, message: impl Into<String>) -> u64 {
        let sequence = self.broadcaster.next_sequence();
        let notification = Notification::new(
            SAMPLE_EVENT,
            NotificationSource::Resource(self.name.clone()),
            sequence,
            message,
        );
        self.broadcaster.send(&notification);
        self.emitted.fetch_add(1, Ordering::SeqCst);
        sequence
    }

    pub fn emit_opaque(&self, message: impl Into<String>) -> u64 {
        let sequence = self.broadcaster.next_sequence();
        let notification = Notification::new(
            SAMPLE_EVENT,
            NotificationSource::Opaque(OpaqueSource::new(self.name.to_string())),
            sequence,
            message,
        );
        self.broadcaster.send(&notification);
        self.emitted.fetch_add(1, Ordering::SeqCst);
        sequence
    }

    pub fn listener_count(&self) -> usize {
        self.broadcaster.listener_count()
    }
}

impl ManagedResource for Emitter {
    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            type_name: EMITTER_TYPE.to_string(),
            description: "Sends notifications on request".to_string(),
            attributes: vec![AttributeInfo {
                name: "EmittedCount".to_string(),
                type_name: "long".to_string(),
                readable: true,
                writable: false,
            }],
            operations: vec![
                OperationInfo {
                    name: "emit".to_string(),
                    signature: vec!["string".to_string()],
                    return_type: "long".to_string(),
                },
                OperationInfo {
                    name: "emitOpaque".to_string(),
                    signature: vec!["string".to_string()],
                    return_type: "long".to_string(),
                },
            ],
            notifications: vec![SAMPLE_EVENT.to_string()],
            interfaces: vec![],
        }
    }

    fn get_attribute(&self, attribute: &str) -> Result<Value, ManagementError> {
        match attribute {
            "EmittedCount" => Ok(json!(self.emitted.load(Ordering::SeqCst))),
            other => Err(ManagementError::AttributeNotFound(other.to_string())),
        }
    }

    fn invoke(
        &self,
        operation: &str,
        params: &[Value],
        _signature: &[String],
    ) -> Result<Value, ManagementError> {
        let message = params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match operation {
            "emit" => Ok(json!(self.emit(message))),
            "emitOpaque" => Ok(json!(self.emit_opaque(message))),
            other => Err(ManagementError::OperationNotFound(other.to_string())),
        }
    }

    fn broadcaster(&self) -> Option<&NotificationBroadcaster> {
        Some(&self.broadcaster)
    }
}
