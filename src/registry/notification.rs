//! Notifications and local fan-out.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::{ManagementError, ObjectName};

/// An event emitted by a managed resource or a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: NotificationSource,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

impl Notification {
    pub fn new(
        kind: impl Into<String>,
        source: NotificationSource,
        sequence: u64,
        message: impl Into<String>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind: kind.into(),
            source,
            sequence,
            timestamp_ms,
            message: message.into(),
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, user_data: Value) -> Self {
        self.user_data = Some(user_data);
        self
    }
}

/// Who emitted a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationSource {
    /// A registered resource
    Resource(ObjectName),
    /// A connector, identified by its connection id
    Connector(String),
    /// An in-process object with no wire representation
    Opaque(OpaqueSource),
}

/// Arbitrary in-process value used as a notification source.
///
/// Serializing it always fails, so notifications carrying one can be
/// delivered locally but never forwarded to a remote subscriber.
#[derive(Clone)]
pub struct OpaqueSource(Arc<dyn Any + Send + Sync>);

impl OpaqueSource {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for OpaqueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpaqueSource(..)")
    }
}

impl PartialEq for OpaqueSource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Serialize for OpaqueSource {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(
            "opaque notification source cannot be serialized",
        ))
    }
}

impl<'de> Deserialize<'de> for OpaqueSource {
    fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom(
            "opaque notification source cannot be deserialized",
        ))
    }
}

/// Receives notifications.
///
/// Called on whichever task delivers the notification; keep it short.
pub trait NotificationListener: Send + Sync {
    fn handle_notification(&self, notification: &Notification, handback: Option<&Value>);
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification, Option<&Value>) + Send + Sync,
{
    fn handle_notification(&self, notification: &Notification, handback: Option<&Value>) {
        self(notification, handback)
    }
}

/// Predicate deciding which notifications reach a listener.
pub type NotificationFilter = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;

/// Listener identity is the allocation, not the value.
pub fn same_listener(a: &Arc<dyn NotificationListener>, b: &Arc<dyn NotificationListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub fn same_filter(a: Option<&NotificationFilter>, b: Option<&NotificationFilter>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

#[derive(Clone)]
struct Registration {
    listener: Arc<dyn NotificationListener>,
    filter: Option<NotificationFilter>,
    handback: Option<Value>,
}

impl Registration {
    fn accepts(&self, notification: &Notification) -> bool {
        self.filter.as_ref().map_or(true, |f| f(notification))
    }
}

/// Fan-out of notifications to registered listeners.
///
/// The registration list is copy-on-write: `send` iterates a snapshot, so
/// listeners may add or remove registrations while being called.
#[derive(Default)]
pub struct NotificationBroadcaster {
    registrations: RwLock<Arc<Vec<Registration>>>,
    sequence: AtomicU64,
}

impl NotificationBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) {
        let mut guard = self.registrations.write();
        let mut next = guard.as_ref().clone();
        next.push(Registration {
            listener,
            filter,
            handback,
        });
        *guard = Arc::new(next);
    }

    /// Remove every registration of `listener`.
    pub fn remove_listener(
        &self,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<(), ManagementError> {
        self.remove_where(|r| same_listener(&r.listener, listener), false)
    }

    /// Remove the registration with exactly this listener, filter and handback.
    pub fn remove_listener_with(
        &self,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> Result<(), ManagementError> {
        self.remove_where(
            |r| {
                same_listener(&r.listener, listener)
                    && same_filter(r.filter.as_ref(), filter)
                    && r.handback.as_ref() == handback
            },
            true,
        )
    }

    fn remove_where<F>(&self, matches: F, first_only: bool) -> Result<(), ManagementError>
    where
        F: Fn(&Registration) -> bool,
    {
        let mut guard = self.registrations.write();
        let mut next = Vec::with_capacity(guard.len());
        let mut removed = 0usize;
        for registration in guard.iter() {
            if matches(registration) && !(first_only && removed > 0) {
                removed += 1;
            } else {
                next.push(registration.clone());
            }
        }
        if removed == 0 {
            return Err(ManagementError::ListenerNotFound(
                "listener is not registered".to_string(),
            ));
        }
        *guard = Arc::new(next);
        Ok(())
    }

    /// Deliver `notification` to every listener whose filter accepts it.
    pub fn send(&self, notification: &Notification) {
        let snapshot = self.registrations.read().clone();
        for registration in snapshot.iter() {
            if registration.accepts(notification) {
                registration
                    .listener
                    .handle_notification(notification, registration.handback.as_ref());
            }
        }
    }

    /// Next sequence number, starting at 1.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }
}
