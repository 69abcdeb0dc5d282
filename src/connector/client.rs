//! Client connector.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use super::{CONNECTION_CLOSED, CONNECTION_OPENED};
use crate::client::{ClientRelay, RemoteResourceServer, RequestInvoker};
use crate::codec::{JsonCodec, MessageCodec};
use crate::config::{InitialEnvironment, ServiceUrl};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::registry::{
    ManagementError, Notification, NotificationBroadcaster, NotificationFilter,
    NotificationListener, NotificationSource, ResourceServer,
};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::TransportProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Fresh,
    Connected,
    Closed,
}

struct Connected {
    supervisor: Arc<ConnectionSupervisor>,
    relay: Arc<ClientRelay>,
}

struct Inner {
    state: ClientState,
    connected: Option<Connected>,
}

/// Client end of a connection to a remote registry.
pub struct ConnectorClient {
    url: ServiceUrl,
    initial: InitialEnvironment,
    provider: Arc<dyn TransportProvider>,
    codec: Arc<dyn MessageCodec>,
    metrics: Arc<Metrics>,
    inner: tokio::sync::Mutex<Inner>,
    connection_id: RwLock<Option<String>>,
    notifications: NotificationBroadcaster,
}

impl ConnectorClient {
    pub fn new(
        url: &str,
        initial: InitialEnvironment,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        Ok(Self {
            url: ServiceUrl::parse(url)?,
            initial,
            provider,
            codec: Arc::new(JsonCodec),
            metrics: Arc::new(Metrics::new()),
            inner: tokio::sync::Mutex::new(Inner {
                state: ClientState::Fresh,
                connected: None,
            }),
            connection_id: RwLock::new(None),
            notifications: NotificationBroadcaster::new(),
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn address(&self) -> &ServiceUrl {
        &self.url
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn state(&self) -> ClientState {
        self.inner.lock().await.state
    }

    /// Connect to the remote side. A no-op when already connected.
    ///
    /// # Errors
    /// * `AlreadyClosed` - the connector was closed
    /// * `Config` - the URL or its parameters are invalid
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ClientState::Connected => return Ok(()),
            ClientState::Closed => return Err(Error::AlreadyClosed),
            ClientState::Fresh => {}
        }

        let supervisor = ConnectionSupervisor::from_url(
            &self.url,
            &self.initial,
            self.provider.as_ref(),
            self.metrics.clone(),
        )?;
        let invoker = Arc::new(RequestInvoker::new(supervisor.clone(), self.codec.clone()));
        let proxy = Arc::new(RemoteResourceServer::new(invoker));
        let relay = ClientRelay::new(proxy, supervisor.clone(), self.codec.clone());

        let connection_id = format!(
            "{}://{} {}",
            self.url.protocol(),
            self.url.transport_uri(),
            uuid::Uuid::new_v4()
        );
        *self.connection_id.write() = Some(connection_id.clone());
        inner.connected = Some(Connected { supervisor, relay });
        inner.state = ClientState::Connected;
        drop(inner);

        info!("Connected to {} as {}", self.url, connection_id);
        self.announce(CONNECTION_OPENED, "Connection Opened", connection_id);
        Ok(())
    }

    /// Close the connector. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == ClientState::Closed {
            return Ok(());
        }
        inner.state = ClientState::Closed;
        let connected = inner.connected.take();
        drop(inner);

        if let Some(connected) = connected {
            // Shut down first: it ends any connection wait holding the relay lock
            connected.supervisor.shutdown().await;
            connected.relay.close().await;
        }

        let connection_id = self.connection_id.read().clone();
        if let Some(connection_id) = connection_id {
            debug!("Closed {}", connection_id);
            self.announce(CONNECTION_CLOSED, "Connection Closed", connection_id);
        }
        Ok(())
    }

    fn announce(&self, kind: &str, message: &str, connection_id: String) {
        let notification = Notification::new(
            kind,
            NotificationSource::Connector(connection_id),
            self.notifications.next_sequence(),
            message,
        );
        self.notifications.send(&notification);
    }

    /// Id of the current connection: `<protocol>://<transport-uri> <uuid>`
    pub fn connection_id(&self) -> Result<String> {
        self.connection_id.read().clone().ok_or(Error::NotConnected)
    }

    /// The remote registry, with notification listener support.
    pub async fn resource_server(&self) -> Result<Arc<dyn ResourceServer>> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.connected) {
            (ClientState::Connected, Some(connected)) => {
                let server: Arc<dyn ResourceServer> = connected.relay.clone();
                Ok(server)
            }
            _ => Err(Error::NotConnected),
        }
    }

    /// Access on behalf of another subject is not provided.
    pub async fn resource_server_for(&self, _subject: &str) -> Result<Arc<dyn ResourceServer>> {
        Err(Error::Unsupported("delegated subject access"))
    }

    pub fn add_connection_notification_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Value>,
    ) {
        self.notifications.add_listener(listener, filter, handback);
    }

    pub fn remove_connection_notification_listener(
        &self,
        listener: &Arc<dyn NotificationListener>,
    ) -> std::result::Result<(), ManagementError> {
        self.notifications.remove_listener(listener)
    }

    pub fn remove_connection_notification_listener_with(
        &self,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Value>,
    ) -> std::result::Result<(), ManagementError> {
        self.notifications
            .remove_listener_with(listener, filter, handback)
    }
}
