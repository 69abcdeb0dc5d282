//! Client half of the notification relay.
//!
//! Every local listener gets an id; the remote side is asked to forward
//! the resource's notifications to this relay's reply channel tagged with
//! that id. After a transport failure the relay opens a new reply channel
//! and subscribes every listener again under the same id.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::RemoteResourceServer;
use crate::codec::{Envelope, MessageCodec};
use crate::error::{Error, Result};
use crate::protocol::RelayedResourceServer;
use crate::registry::{
    same_filter, same_listener, Attribute, ManagementError, NotificationFilter,
    NotificationListener, ObjectInstance, ObjectName, ResourceInfo, ResourceServer,
};
use crate::supervisor::{ConnectionSupervisor, FailureNotice};
use crate::transport::{Consumer, Destination, Session};

struct ClientListener {
    id: String,
    name: ObjectName,
    listener: Arc<dyn NotificationListener>,
    filter: Option<NotificationFilter>,
    handback: Option<Value>,
}

struct ReplyChannel {
    destination: Destination,
    session: Arc<dyn Session>,
    task: JoinHandle<()>,
}

impl ReplyChannel {
    async fn close(self) {
        self.task.abort();
        self.session.close().await;
    }
}

/// Local listener bookkeeping on top of a [`RemoteResourceServer`].
///
/// Implements [`ResourceServer`] by delegating to the proxy, except for
/// the notification listener methods, which it serves itself.
pub struct ClientRelay {
    me: Weak<Self>,
    proxy: Arc<RemoteResourceServer>,
    supervisor: Arc<ConnectionSupervisor>,
    codec: Arc<dyn MessageCodec>,
    listeners: RwLock<Arc<Vec<Arc<ClientListener>>>>,
    /// Relay lock: held while subscribing, unsubscribing or rebuilding
    channel: tokio::sync::Mutex<Option<ReplyChannel>>,
    recovery: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClientRelay {
    /// Must be called from within a tokio runtime.
    pub fn new(
        proxy: Arc<RemoteResourceServer>,
        supervisor: Arc<ConnectionSupervisor>,
        codec: Arc<dyn MessageCodec>,
    ) -> Arc<Self> {
        let notices = supervisor.failure_notices();
        let relay = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            proxy,
            supervisor,
            codec,
            listeners: RwLock::new(Arc::new(Vec::new())),
            channel: tokio::sync::Mutex::new(None),
            recovery: parking_lot::Mutex::new(None),
        });
        let task = tokio::spawn(Self::recovery_loop(Arc::downgrade(&relay), notices));
        *relay.recovery.lock() = Some(task);
        relay
    }

    pub fn proxy(&self) -> &Arc<RemoteResourceServer> {
        &self.proxy
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Drop every local listener and the reply channel. Remote
    /// subscriptions are left to expire with the connection.
    pub async fn close(&self) {
        if let Some(task) = self.recovery.lock().take() {
            task.abort();
        }
        let mut channel = self.channel.lock().await;
        if let Some(old) = channel.take() {
            old.close().await;
        }
        *self.listeners.write() = Arc::new(Vec::new());
    }

    fn push(&self, entry: Arc<ClientListener>) {
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push(entry);
        *guard = Arc::new(next);
    }

    fn take_where<F>(&self, matches: F, first_only: bool) -> Vec<Arc<ClientListener>>
    where
        F: Fn(&ClientListener) -> bool,
    {
        let mut guard = self.listeners.write();
        let mut kept = Vec::with_capacity(guard.len());
        let mut taken = Vec::new();
        for entry in guard.iter() {
            if matches(entry) && !(first_only && !taken.is_empty()) {
                taken.push(entry.clone());
            } else {
                kept.push(entry.clone());
            }
        }
        if !taken.is_empty() {
            *guard = Arc::new(kept);
        }
        taken
    }

    fn is_registered(&self, id: &str) -> bool {
        self.listeners.read().iter().any(|entry| entry.id == id)
    }

    /// The live reply channel, opening a new one if needed.
    async fn ensure_channel(&self, slot: &mut Option<ReplyChannel>) -> Result<Destination> {
        if let Some(channel) = slot.as_ref() {
            if !channel.task.is_finished() {
                return Ok(channel.destination.clone());
            }
        }
        if let Some(stale) = slot.take() {
            stale.close().await;
        }

        let conn = self.supervisor.connect().await?;
        let session = conn.create_session().await?;
        let destination = match self.supervisor.create_temporary_destination(&conn).await {
            Ok(destination) => destination,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        let consumer = match session.create_consumer(&destination).await {
            Ok(consumer) => consumer,
            Err(e) => {
                session.close().await;
                self.supervisor.delete_temporary_destination(&destination).await;
                return Err(e.into());
            }
        };

        debug!("Receiving notifications on {}", destination);
        let task = tokio::spawn(Self::consume(self.me.clone(), consumer));
        *slot = Some(ReplyChannel {
            destination: destination.clone(),
            session,
            task,
        });
        Ok(destination)
    }

    async fn consume(relay: Weak<Self>, mut consumer: Box<dyn Consumer>) {
        while let Some(message) = consumer.receive().await {
            let Some(relay) = relay.upgrade() else {
                break;
            };
            relay.deliver(&message.body);
        }
        trace!("Notification consumer ended");
    }

    fn deliver(&self, body: &str) {
        let (listener_id, notification) = match self.codec.decode(body) {
            Ok(Envelope::Notification {
                listener_id,
                notification,
            }) => (listener_id, notification),
            Ok(other) => {
                warn!(
                    "Ignoring {} envelope on the notification channel",
                    other.kind()
                );
                return;
            }
            Err(e) => {
                error!("Dropping undecodable notification: {}", e);
                return;
            }
        };

        let snapshot = self.listeners.read().clone();
        for entry in snapshot.iter().filter(|entry| entry.id == listener_id) {
            if entry.filter.as_ref().map_or(true, |f| f(&notification)) {
                entry
                    .listener
                    .handle_notification(&notification, entry.handback.as_ref());
                self.supervisor.metrics().notifications_delivered.inc();
            }
        }
    }

    async fn unsubscribe_all(&self, removed: Vec<Arc<ClientListener>>) -> Result<()> {
        let mut first_error = None;
        for entry in removed {
            if let Err(e) = self.proxy.remove_relay_listener(&entry.id).await {
                debug!("Remote removal of listener {} failed: {}", entry.id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn recovery_loop(relay: Weak<Self>, mut notices: mpsc::UnboundedReceiver<FailureNotice>) {
        while let Some(notice) = notices.recv().await {
            let Some(relay) = relay.upgrade() else {
                break;
            };
            relay.recover(&notice).await;
        }
    }

    /// Open a new reply channel and subscribe every listener again,
    /// retrying the ones that fail every retry interval.
    async fn recover(&self, notice: &FailureNotice) {
        // Listed under the relay lock: a subscription made on the old
        // channel just before it closes must be re-driven too
        let mut pending: Vec<Arc<ClientListener>> = {
            let mut channel = self.channel.lock().await;
            if let Some(old) = channel.take() {
                old.close().await;
            }
            self.listeners.read().iter().cloned().collect()
        };
        debug!(
            "Transport failure ({}), re-subscribing {} listeners",
            notice.error,
            pending.len()
        );
        if pending.is_empty() {
            return;
        }

        loop {
            {
                let mut channel = self.channel.lock().await;
                pending.retain(|entry| self.is_registered(&entry.id));
                match self.ensure_channel(&mut channel).await {
                    Ok(reply_to) => {
                        let mut retry = Vec::new();
                        for entry in pending.drain(..) {
                            match self
                                .proxy
                                .add_relay_listener(&entry.id, &entry.name, &reply_to)
                                .await
                            {
                                Ok(()) => trace!("Listener {} re-subscribed", entry.id),
                                Err(Error::Interrupted) => return,
                                Err(Error::Management(e)) => {
                                    warn!(
                                        "Dropping listener on {} after re-subscription failed: {}",
                                        entry.name, e
                                    );
                                    self.take_where(|l| l.id == entry.id, false);
                                }
                                Err(e) => {
                                    trace!("Re-subscribing listener {} failed: {}", entry.id, e);
                                    retry.push(entry);
                                }
                            }
                        }
                        pending = retry;
                    }
                    Err(Error::Interrupted) => return,
                    Err(e) => trace!("Reopening the notification channel failed: {}", e),
                }
                if pending.is_empty() && channel.is_some() {
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.supervisor.retry_interval()) => {}
                _ = self.supervisor.shut_down() => return,
            }
        }
    }
}

#[async_trait]
impl ResourceServer for ClientRelay {
    async fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value> {
        self.proxy.get_attribute(name, attribute).await
    }

    async fn get_attributes(
        &self,
        name: &ObjectName,
        attributes: &[String],
    ) -> Result<Vec<Attribute>> {
        self.proxy.get_attributes(name, attributes).await
    }

    async fn set_attribute(&self, name: &ObjectName, attribute: Attribute) -> Result<()> {
        self.proxy.set_attribute(name, attribute).await
    }

    async fn set_attributes(
        &self,
        name: &ObjectName,
        attributes: Vec<Attribute>,
    ) -> Result<Vec<Attribute>> {
        self.proxy.set_attributes(name, attributes).await
    }

    async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> Result<Value> {
        self.proxy.invoke(name, operation, params, signature).await
    }

    async fn query_names(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectName>> {
        self.proxy.query_names(pattern).await
    }

    async fn query_resources(&self, pattern: Option<&ObjectName>) -> Result<Vec<ObjectInstance>> {
        self.proxy.query_resources(pattern).await
    }

    async fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance> {
        self.proxy.object_instance(name).await
    }

    async fn is_registered(&self, name: &ObjectName) -> Result<bool> {
        self.proxy.is_registered(name).await
    }

    async fn resource_count(&self) -> Result<usize> {
        self.proxy.resource_count().await
    }

    async fn resource_info(&self, name: &ObjectName) -> Result<ResourceInfo> {
        self.proxy.resource_info(name).await
    }

    async fn is_instance_of(&self, name: &ObjectName, type_name: &str) -> Result<bool> {
        self.proxy.is_instance_of(name, type_name).await
    }

    async fn default_domain(&self) -> Result<String> {
        self.proxy.default_domain().await
    }

    async fn domains(&self) -> Result<Vec<String>> {
        self.proxy.domains().await
    }

    async fn unregister(&self, name: &ObjectName) -> Result<()> {
        self.proxy.unregister(name).await
    }

    async fn add_notification_listener(
        &self,
        name: &ObjectName,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) -> Result<()> {
        let mut channel = self.channel.lock().await;
        let reply_to = self.ensure_channel(&mut channel).await?;

        let entry = Arc::new(ClientListener {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.clone(),
            listener,
            filter,
            handback,
        });
        // Registered locally first so nothing forwarded right after the
        // remote subscription is missed
        self.push(entry.clone());

        if let Err(e) = self
            .proxy
            .add_relay_listener(&entry.id, name, &reply_to)
            .await
        {
            self.take_where(|l| l.id == entry.id, false);
            return Err(e);
        }
        debug!("Listener {} subscribed to {}", entry.id, name);
        Ok(())
    }

    async fn remove_notification_listener(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<()> {
        let _channel = self.channel.lock().await;
        let removed = self.take_where(
            |entry| &entry.name == name && same_listener(&entry.listener, listener),
            false,
        );
        if removed.is_empty() {
            return Err(ManagementError::ListenerNotFound(format!(
                "listener is not registered on {}",
                name
            ))
            .into());
        }
        self.unsubscribe_all(removed).await
    }

    async fn remove_notification_listener_with(
        &self,
        name: &ObjectName,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> Result<()> {
        let _channel = self.channel.lock().await;
        let removed = self.take_where(
            |entry| {
                &entry.name == name
                    && same_listener(&entry.listener, listener)
                    && same_filter(entry.filter.as_ref(), filter)
                    && entry.handback.as_ref() == handback
            },
            true,
        );
        if removed.is_empty() {
            return Err(ManagementError::ListenerNotFound(format!(
                "no matching listener registration on {}",
                name
            ))
            .into());
        }
        self.unsubscribe_all(removed).await
    }
}
