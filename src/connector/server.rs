//! Server connector.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{JsonCodec, MessageCodec};
use crate::config::{InitialEnvironment, ServiceUrl};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::registry::ResourceServer;
use crate::server::{ServerRelay, ServiceDispatcher};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::TransportProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Fresh,
    Started,
    Stopped,
}

struct Started {
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: Arc<ServiceDispatcher>,
    relay: Arc<ServerRelay>,
}

struct Inner {
    state: ServerState,
    started: Option<Started>,
}

/// Serves a registry to remote clients over the transport.
pub struct ConnectorServer {
    url: ServiceUrl,
    initial: InitialEnvironment,
    provider: Arc<dyn TransportProvider>,
    registry: Arc<dyn ResourceServer>,
    codec: Arc<dyn MessageCodec>,
    metrics: Arc<Metrics>,
    inner: tokio::sync::Mutex<Inner>,
    /// Serializes `start()` calls; `stop()` never waits on it
    starting: tokio::sync::Mutex<()>,
}

impl ConnectorServer {
    pub fn new(
        url: &str,
        initial: InitialEnvironment,
        provider: Arc<dyn TransportProvider>,
        registry: Arc<dyn ResourceServer>,
    ) -> Result<Self> {
        Ok(Self {
            url: ServiceUrl::parse(url)?,
            initial,
            provider,
            registry,
            codec: Arc::new(JsonCodec),
            metrics: Arc::new(Metrics::new()),
            inner: tokio::sync::Mutex::new(Inner {
                state: ServerState::Fresh,
                started: None,
            }),
            starting: tokio::sync::Mutex::new(()),
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

    /// The attribute map this server was created with
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.initial.attributes
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == ServerState::Started
    }

    /// Start serving. Returns once requests are being consumed; a no-op
    /// when already started.
    ///
    /// While the broker is unreachable this waits for it, but `stop()`
    /// may still be called and ends the wait.
    ///
    /// # Errors
    /// * `AlreadyStopped` - the server was stopped
    /// * `Interrupted` - `stop()` was called before the first subscription
    pub async fn start(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        let dispatcher = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ServerState::Started => return Ok(()),
                ServerState::Stopped => return Err(Error::AlreadyStopped),
                ServerState::Fresh => {}
            }

            let supervisor = ConnectionSupervisor::from_url(
                &self.url,
                &self.initial,
                self.provider.as_ref(),
                self.metrics.clone(),
            )?;
            let relay =
                ServerRelay::new(self.registry.clone(), supervisor.clone(), self.codec.clone());
            let dispatcher =
                ServiceDispatcher::new(supervisor.clone(), self.codec.clone(), relay.clone());
            // Published before subscribing so stop() can shut it down
            inner.started = Some(Started {
                supervisor,
                dispatcher: dispatcher.clone(),
                relay,
            });
            dispatcher
        };

        let subscribed = dispatcher.start().await;

        let mut inner = self.inner.lock().await;
        if inner.state == ServerState::Stopped {
            debug!("Stopped while starting at {}", self.url);
            return Err(Error::Interrupted);
        }
        if let Err(e) = subscribed {
            let started = inner.started.take();
            drop(inner);
            if let Some(started) = started {
                started.dispatcher.stop().await;
                started.relay.close().await;
                started.supervisor.shutdown().await;
            }
            return Err(e);
        }

        if let Some(started) = inner.started.as_ref() {
            let env = started.supervisor.environment();
            info!(
                "Serving {} {} at {}",
                env.destination_kind, env.destination_name, self.url
            );
        }
        inner.state = ServerState::Started;
        Ok(())
    }

    /// Stop serving. Later calls are no-ops.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == ServerState::Stopped {
            return Ok(());
        }
        inner.state = ServerState::Stopped;

        if let Some(started) = inner.started.take() {
            started.dispatcher.stop().await;
            started.relay.close().await;
            started.supervisor.shutdown().await;
            info!("Stopped serving at {}", self.url);
        }
        Ok(())
    }

    /// Not provided: clients build their own connector from the address.
    pub fn to_client_connector(&self) -> Result<super::ConnectorClient> {
        Err(Error::Unsupported("to_client_connector"))
    }
}
