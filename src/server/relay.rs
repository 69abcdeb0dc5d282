//! Server half of the notification relay.
//!
//! For every remote subscription an internal listener is added to the
//! registry. It encodes each notification and hands it to a forwarding
//! task that sends it to the subscriber's reply channel. Encoding and send
//! failures drop that one notification.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{Envelope, MessageCodec};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::protocol::RelayedResourceServer;
use crate::registry::{
    Attribute, Notification, NotificationFilter, NotificationListener, ObjectInstance,
    ObjectName, ResourceInfo, ResourceServer,
};
use crate::supervisor::{ConnectionSupervisor, FailureNotice, ManagedConnection};
use crate::transport::{Destination, Message, Producer, Session};

/// Delay between attempts to set up a subscription's sender
pub const SUBSCRIBE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Registry listener feeding one subscription's forwarding task.
struct Forwarder {
    listener_id: String,
    codec: Arc<dyn MessageCodec>,
    tx: mpsc::UnboundedSender<String>,
    metrics: Arc<Metrics>,
}

impl NotificationListener for Forwarder {
    fn handle_notification(&self, notification: &Notification, _handback: Option<&Value>) {
        let envelope = Envelope::Notification {
            listener_id: self.listener_id.clone(),
            notification: notification.clone(),
        };
        match self.codec.encode(&envelope) {
            Ok(body) => {
                if self.tx.send(body).is_err() {
                    self.metrics.notifications_dropped.inc();
                }
            }
            Err(e) => {
                trace!(
                    "Dropping notification {} for listener {}: {}",
                    notification.sequence,
                    self.listener_id,
                    e
                );
                self.metrics.notifications_dropped.inc();
            }
        }
    }
}

async fn forward(
    producer: Box<dyn Producer>,
    mut rx: mpsc::UnboundedReceiver<String>,
    metrics: Arc<Metrics>,
) {
    while let Some(body) = rx.recv().await {
        match producer.send(Message::text(body)).await {
            Ok(()) => metrics.notifications_forwarded.inc(),
            Err(e) => {
                trace!("Dropping forwarded notification: {}", e);
                metrics.notifications_dropped.inc();
            }
        }
    }
    producer.close().await;
}

struct Subscription {
    name: ObjectName,
    listener: Arc<dyn NotificationListener>,
    generation: u64,
    task: JoinHandle<()>,
}

struct RelaySession {
    conn: Arc<ManagedConnection>,
    session: Arc<dyn Session>,
}

/// Forwards registry notifications to remote subscribers.
///
/// Wraps the served registry and is what the dispatcher executes requests
/// against.
pub struct ServerRelay {
    registry: Arc<dyn ResourceServer>,
    supervisor: Arc<ConnectionSupervisor>,
    codec: Arc<dyn MessageCodec>,
    subscriptions: DashMap<String, Subscription>,
    session: tokio::sync::Mutex<Option<RelaySession>>,
    recovery: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServerRelay {
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<dyn ResourceServer>,
        supervisor: Arc<ConnectionSupervisor>,
        codec: Arc<dyn MessageCodec>,
    ) -> Arc<Self> {
        let notices = supervisor.failure_notices();
        let relay = Arc::new(Self {
            registry,
            supervisor,
            codec,
            subscriptions: DashMap::new(),
            session: tokio::sync::Mutex::new(None),
            recovery: parking_lot::Mutex::new(None),
        });
        let task = tokio::spawn(Self::recovery_loop(Arc::downgrade(&relay), notices));
        *relay.recovery.lock() = Some(task);
        relay
    }

    pub fn registry(&self) -> &Arc<dyn ResourceServer> {
        &self.registry
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Remove every subscription and release the relay session.
    pub async fn close(&self) {
        if let Some(task) = self.recovery.lock().take() {
            task.abort();
        }
        self.drop_subscriptions(u64::MAX).await;
        if let Some(old) = self.session.lock().await.take() {
            old.session.close().await;
        }
    }

    async fn relay_session(&self) -> Result<(u64, Arc<dyn Session>)> {
        let mut slot = self.session.lock().await;
        if let Some(current) = slot.as_ref() {
            if !current.conn.is_failed() {
                return Ok((current.conn.generation(), current.session.clone()));
            }
        }
        let conn = self.supervisor.connect().await?;
        let session = conn.create_session().await?;
        let generation = conn.generation();
        *slot = Some(RelaySession {
            conn,
            session: session.clone(),
        });
        Ok((generation, session))
    }

    async fn try_subscribe(
        &self,
        listener_id: &str,
        name: &ObjectName,
        reply_to: &Destination,
    ) -> Result<()> {
        let (generation, session) = self.relay_session().await?;
        let producer = session.create_producer(reply_to).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn NotificationListener> = Arc::new(Forwarder {
            listener_id: listener_id.to_string(),
            codec: self.codec.clone(),
            tx,
            metrics: self.supervisor.metrics().clone(),
        });
        self.registry
            .add_notification_listener(name, listener.clone(), None, None)
            .await?;

        let task = tokio::spawn(forward(producer, rx, self.supervisor.metrics().clone()));
        let previous = self.subscriptions.insert(
            listener_id.to_string(),
            Subscription {
                name: name.clone(),
                listener,
                generation,
                task,
            },
        );
        if let Some(previous) = previous {
            self.detach(listener_id, previous).await;
        }
        self.update_gauge();
        debug!(
            "Forwarding notifications of {} to {} as {}",
            name, reply_to, listener_id
        );
        Ok(())
    }

    async fn detach(&self, listener_id: &str, subscription: Subscription) {
        if let Err(e) = self
            .registry
            .remove_notification_listener(&subscription.name, &subscription.listener)
            .await
        {
            trace!("Registry listener {} already gone: {}", listener_id, e);
        }
        // Dropping the registry listener closes the channel; the task
        // drains what was queued and exits
        drop(subscription.listener);
        drop(subscription.task);
    }

    fn update_gauge(&self) {
        self.supervisor
            .metrics()
            .relay_listeners
            .set(self.subscriptions.len() as i64);
    }

    /// Remove subscriptions created on `generation` or older.
    async fn drop_subscriptions(&self, generation: u64) {
        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().generation <= generation)
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            if let Some((id, subscription)) = self
                .subscriptions
                .remove_if(&id, |_, s| s.generation <= generation)
            {
                self.detach(&id, subscription).await;
            }
        }
        self.update_gauge();
    }

    async fn recovery_loop(relay: Weak<Self>, mut notices: mpsc::UnboundedReceiver<FailureNotice>) {
        while let Some(notice) = notices.recv().await {
            let Some(relay) = relay.upgrade() else {
                break;
            };
            relay.recover(&notice).await;
        }
    }

    /// Subscriptions do not survive a transport failure; the subscriber
    /// is expected to subscribe again.
    async fn recover(&self, notice: &FailureNotice) {
        debug!(
            "Transport failure ({}), dropping {} subscriptions",
            notice.error,
            self.subscriptions.len()
        );
        self.drop_subscriptions(notice.generation).await;

        let stale = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(current) if current.conn.generation() <= notice.generation => slot.take(),
                _ => None,
            }
        };
        if let Some(stale) = stale {
            stale.session.close().await;
        }

        match self.relay_session().await {
            Ok((generation, _)) => trace!("Relay session re-created on generation {}", generation),
            Err(e) => trace!("Relay session not re-created: {}", e),
        }
    }
}

#[async_trait]
impl RelayedResourceServer for ServerRelay {
    /// Transport errors are retried every [`SUBSCRIBE_RETRY_INTERVAL`];
    /// registry errors are returned to the subscriber.
    async fn add_relay_listener(
        &self,
        listener_id: &str,
        name: &ObjectName,
        reply_to: &Destination,
    ) -> Result<()> {
        loop {
            match self.try_subscribe(listener_id, name, reply_to).await {
                Err(Error::Transport(e)) => {
                    warn!(
                        "Subscribing {} to {} failed, retrying in {:?}: {}",
                        listener_id, name, SUBSCRIBE_RETRY_INTERVAL, e
                    );
                }
                other => return other,
            }
            tokio::select! {
                _ = tokio::time::sleep(SUBSCRIBE_RETRY_INTERVAL) => {}
                _ = self.supervisor.shut_down() => return Err(Error::Interrupted),
            }
        }
    }

    async fn remove_relay_listener(&self, listener_id: &str) -> Result<()> {
        if let Some((id, subscription)) = self.subscriptions.remove(listener_id) {
            self.detach(&id, subscription).await;
            self.update_gauge();
            debug!("Stopped forwarding for {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceServer for ServerRelay {
    async fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value> {
        self.registry.get_attribute(name, attribute).await
    }

    async fn get_attributes(
        &self,
        name: &ObjectName,
        attributes: &[String],
    ) -> Result<Vec<Attribute>> {
        self.registry.get_attributes(name, attributes).await
    }

    async fn set_attribute(&self, name: &ObjectName, attribute: Attribute) -> Result<()> {
        self.registry.set_attribute(name, attribute).await
    }

    async fn set_attributes(
        &self,
        name: &ObjectName,
        attributes: Vec<Attribute>,
    ) -> Result<Vec<Attribute>> {
        self.registry.set_attributes(name, attributes).await
    }

    async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> Result<Value> {
        self.registry.invoke(name, operation, params, signature).await
    }

    async fn query_names(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectName>> {
        self.registry.query_names(pattern).await
    }

    async fn query_resources(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectInstance>> {
        self.registry.query_resources(pattern).await
    }

    async fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance> {
        self.registry.object_instance(name).await
    }

    async fn is_registered(&self, name: &ObjectName) -> Result<bool> {
        self.registry.is_registered(name).await
    }

    async fn resource_count(&self) -> Result<usize> {
        self.registry.resource_count().await
    }

    async fn resource_info(&self, name: &ObjectName) -> Result<ResourceInfo> {
        self.registry.resource_info(name).await
    }

    async fn is_instance_of(&self, name: &ObjectName, type_name: &str) -> Result<bool> {
        self.registry.is_instance_of(name, type_name).await
    }

    async fn default_domain(&self) -> Result<String> {
        self.registry.default_domain().await
    }

    async fn domains(&self) -> Result<Vec<String>> {
        self.registry.domains().await
    }

    async fn unregister(&self, name: &ObjectName) -> Result<()> {
        self.registry.unregister(name).await
    }

    async fn add_notification_listener(
        &self,
        name: &ObjectName,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) -> Result<()> {
        self.registry
            .add_notification_listener(name, listener, filter, handback)
            .await
    }

    async fn remove_notification_listener(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<()> {
        self.registry
            .remove_notification_listener(name, listener)
            .await
    }

    async fn remove_notification_listener_with(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> Result<()> {
        self.registry
            .remove_notification_listener_with(name, listener, filter, handback)
            .await
    }
}
