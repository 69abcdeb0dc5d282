//! Connection Supervisor
//!
//! Owns the transport of one connector: the lazily established default
//! connection, connections opened on request, and every temporary
//! destination handed out. Attempts to connect are retried every
//! `retry-interval-ms` until they succeed or the supervisor is shut down.
//!
//! Failure callbacks from the transport only flag the connection and post a
//! notice to the supervisor's own task. That task tears the failed
//! generation down and then tells every failure subscriber (the relays),
//! which rebuild on their own.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::{
    ConfigError, ConnectionEnvironment, Credentials, InitialEnvironment, ServiceUrl,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::transport::{Connection, Destination, Session, Transport, TransportError, TransportProvider};

/// Sent to failure subscribers once a connection generation has been torn
/// down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub generation: u64,
    pub error: TransportError,
}

/// The shared connection and its base session.
///
/// Never revived: after a failure or `destroy()` the supervisor replaces
/// it with a new one carrying a higher generation.
pub struct ManagedConnection {
    generation: u64,
    connection: Arc<dyn Connection>,
    session: Arc<dyn Session>,
    failed: Arc<AtomicBool>,
}

impl ManagedConnection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Session used for destination lookup and temporary destinations
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub async fn create_session(&self) -> std::result::Result<Arc<dyn Session>, TransportError> {
        self.connection.create_session().await
    }
}

struct TrackedTemporary {
    destination: Destination,
    owner: Arc<ManagedConnection>,
}

pub struct ConnectionSupervisor {
    url: ServiceUrl,
    env: ConnectionEnvironment,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
    /// Default connection; replaced wholesale, never mutated in place
    slot: Mutex<Option<Arc<ManagedConnection>>>,
    /// Serializes establishment so at most one default connection exists
    connecting: tokio::sync::Mutex<()>,
    opened: Mutex<Vec<Arc<dyn Connection>>>,
    temporaries: Mutex<Vec<TrackedTemporary>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FailureNotice>>>,
    events: mpsc::UnboundedSender<FailureNotice>,
    interrupt: watch::Sender<bool>,
    generation: AtomicU64,
    /// Highest generation already torn down after a failure
    purged: AtomicU64,
}

impl ConnectionSupervisor {
    /// Build a supervisor for `url`, served by `provider`.
    ///
    /// Spawns the failure task, so it must be called from within a tokio
    /// runtime. Nothing is connected until [`connect`](Self::connect).
    pub fn from_url(
        url: &ServiceUrl,
        initial: &InitialEnvironment,
        provider: &dyn TransportProvider,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        if !provider.protocols().iter().any(|p| *p == url.protocol()) {
            return Err(ConfigError::MalformedUrl(format!(
                "Wrong protocol {} for provider",
                url.protocol()
            ))
            .into());
        }
        let env = ConnectionEnvironment::build(initial, url)?;
        let transport = provider.create_transport(&url.broker_uri())?;
        Ok(Self::new(url.clone(), env, transport, metrics))
    }

    pub fn new(
        url: ServiceUrl,
        env: ConnectionEnvironment,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (interrupt, _) = watch::channel(false);
        debug!(
            "Supervisor for {} targeting {} {}",
            transport.broker_uri(),
            env.destination_kind,
            env.destination_name
        );
        let supervisor = Arc::new(Self {
            url,
            env,
            transport,
            metrics,
            slot: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            opened: Mutex::new(Vec::new()),
            temporaries: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            events,
            interrupt,
            generation: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        });
        tokio::spawn(Self::failure_loop(Arc::downgrade(&supervisor), events_rx));
        supervisor
    }

    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    pub fn environment(&self) -> &ConnectionEnvironment {
        &self.env
    }

    pub fn retry_interval(&self) -> Duration {
        self.env.retry_interval
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Resolves once `shutdown()` has been called.
    pub async fn shut_down(&self) {
        let mut interrupt = self.interrupt.subscribe();
        let _ = interrupt.wait_for(|stop| *stop).await;
    }

    fn current(&self) -> Option<Arc<ManagedConnection>> {
        self.slot
            .lock()
            .as_ref()
            .filter(|conn| !conn.is_failed())
            .cloned()
    }

    /// The shared connection, established on first use.
    ///
    /// Waits as long as it takes for the broker to accept the connection;
    /// only `shutdown()` ends the wait, with [`Error::Interrupted`].
    pub async fn connect(&self) -> Result<Arc<ManagedConnection>> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let _guard = self.connecting.lock().await;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        if self.is_shut_down() {
            return Err(Error::Interrupted);
        }

        let conn = self.establish().await?;
        if self.is_shut_down() {
            conn.session.close().await;
            conn.connection.close().await;
            return Err(Error::Interrupted);
        }
        *self.slot.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn establish(&self) -> Result<Arc<ManagedConnection>> {
        let mut interrupt = self.interrupt.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if *interrupt.borrow() {
                return Err(Error::Interrupted);
            }
            attempt += 1;
            self.metrics.connection_attempts.inc();

            match self.open_managed().await {
                Ok(conn) => {
                    self.metrics.connections_established.inc();
                    debug!(
                        "Connected to {} (generation {}, attempt {})",
                        self.transport.broker_uri(),
                        conn.generation,
                        attempt
                    );
                    return Ok(conn);
                }
                Err(e) if attempt == 1 => {
                    warn!(
                        "Connection to {} failed, retrying every {:?}: {}",
                        self.transport.broker_uri(),
                        self.env.retry_interval,
                        e
                    );
                }
                Err(_) => {
                    trace!(
                        "Connection attempt {} to {} failed",
                        attempt,
                        self.transport.broker_uri()
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.env.retry_interval) => {}
                _ = interrupt.wait_for(|stop| *stop) => return Err(Error::Interrupted),
            }
        }
    }

    async fn open_managed(&self) -> std::result::Result<Arc<ManagedConnection>, TransportError> {
        let connection = self
            .transport
            .connect(self.env.credentials.as_ref(), self.env.client_id.as_deref())
            .await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let failed = Arc::new(AtomicBool::new(false));

        let flag = failed.clone();
        let events = self.events.clone();
        connection.set_failure_listener(Arc::new(move |error: &TransportError| {
            flag.store(true, Ordering::SeqCst);
            let _ = events.send(FailureNotice {
                generation,
                error: error.clone(),
            });
        }));

        let session = match connection.create_session().await {
            Ok(session) => session,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        Ok(Arc::new(ManagedConnection {
            generation,
            connection,
            session,
            failed,
        }))
    }

    /// Open an additional connection, closed by `destroy()`.
    ///
    /// Uses `credentials` when given, the configured ones otherwise.
    pub async fn open_connection(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Connection>> {
        let credentials = credentials.or(self.env.credentials.as_ref());
        let connection = self.transport.connect(credentials, None).await?;
        self.opened.lock().push(connection.clone());
        Ok(connection)
    }

    /// The request destination on `conn`.
    pub async fn target_destination(&self, conn: &ManagedConnection) -> Result<Destination> {
        Ok(self
            .env
            .destination_kind
            .resolve(conn.session.as_ref(), &self.env.destination_name)
            .await?)
    }

    /// Create a reply channel of the target's kind on `conn`, tracked until
    /// deleted or torn down.
    pub async fn create_temporary_destination(
        &self,
        conn: &Arc<ManagedConnection>,
    ) -> Result<Destination> {
        let destination = self
            .env
            .destination_kind
            .create_reply_channel(conn.session.as_ref())
            .await?;
        self.temporaries.lock().push(TrackedTemporary {
            destination: destination.clone(),
            owner: conn.clone(),
        });
        Ok(destination)
    }

    /// Delete a destination created by `create_temporary_destination`.
    /// Unknown destinations are ignored.
    pub async fn delete_temporary_destination(&self, destination: &Destination) {
        let tracked = {
            let mut temporaries = self.temporaries.lock();
            temporaries
                .iter()
                .position(|t| &t.destination == destination)
                .map(|index| temporaries.swap_remove(index))
        };
        if let Some(tracked) = tracked {
            Self::delete_quietly(tracked).await;
        }
    }

    async fn delete_quietly(tracked: TrackedTemporary) {
        if let Err(e) = tracked
            .owner
            .session
            .delete_temporary(&tracked.destination)
            .await
        {
            trace!("Could not delete {}: {}", tracked.destination, e);
        }
    }

    pub fn temporary_destination_count(&self) -> usize {
        self.temporaries.lock().len()
    }

    /// Receive a notice after every transport failure, once the failed
    /// connection has been torn down.
    pub fn failure_notices(&self) -> mpsc::UnboundedReceiver<FailureNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delete every tracked temporary destination, close every opened
    /// connection and tear down the default connection. Idempotent.
    pub async fn destroy(&self) {
        let temporaries = std::mem::take(&mut *self.temporaries.lock());
        for tracked in temporaries {
            Self::delete_quietly(tracked).await;
        }

        let opened = std::mem::take(&mut *self.opened.lock());
        for connection in opened {
            connection.close().await;
        }

        let current = self.slot.lock().take();
        if let Some(conn) = current {
            debug!("Closing connection generation {}", conn.generation);
            conn.session.close().await;
            conn.connection.close().await;
        }
    }

    /// Interrupt pending connection attempts and destroy everything. The
    /// supervisor refuses to connect afterwards.
    pub async fn shutdown(&self) {
        self.interrupt.send_replace(true);
        self.destroy().await;
        self.subscribers.lock().clear();
    }

    async fn failure_loop(
        supervisor: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<FailureNotice>,
    ) {
        while let Some(notice) = events.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            supervisor.handle_failure(notice).await;
        }
    }

    async fn handle_failure(&self, notice: FailureNotice) {
        if self.purged.fetch_max(notice.generation, Ordering::SeqCst) >= notice.generation {
            return;
        }
        warn!(
            "Connection generation {} to {} failed: {}",
            notice.generation,
            self.transport.broker_uri(),
            notice.error
        );
        self.metrics.connection_failures.inc();
        self.purge(notice.generation).await;

        if self.is_shut_down() {
            return;
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Tear down everything belonging to `generation` or older.
    async fn purge(&self, generation: u64) {
        let stale = {
            let mut temporaries = self.temporaries.lock();
            let (stale, live) = std::mem::take(&mut *temporaries)
                .into_iter()
                .partition::<Vec<_>, _>(|t| t.owner.generation <= generation);
            *temporaries = live;
            stale
        };
        for tracked in stale {
            Self::delete_quietly(tracked).await;
        }

        let opened = std::mem::take(&mut *self.opened.lock());
        for connection in opened {
            connection.close().await;
        }

        let current = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(conn) if conn.generation <= generation => slot.take(),
                _ => None,
            }
        };
        if let Some(conn) = current {
            conn.connection.close().await;
        }
    }
}
