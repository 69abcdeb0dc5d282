//! Request/reply over the transport.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::codec::{Envelope, MessageCodec};
use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::supervisor::{ConnectionSupervisor, ManagedConnection};
use crate::transport::{Consumer, Destination, Message, Session, TransportError};

fn undeliverable(err: TransportError) -> Error {
    Error::RemoteInvocation(err.to_string())
}

fn from_supervisor(err: Error) -> Error {
    match err {
        Error::Transport(e) => undeliverable(e),
        other => other,
    }
}

/// Sends one request per call and waits for its reply.
///
/// Each call gets its own session and its own temporary reply destination;
/// both are released whatever the outcome.
pub struct RequestInvoker {
    supervisor: Arc<ConnectionSupervisor>,
    codec: Arc<dyn MessageCodec>,
}

impl RequestInvoker {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, codec: Arc<dyn MessageCodec>) -> Self {
        Self { supervisor, codec }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Send `request` to the service destination and return the remote
    /// result.
    ///
    /// # Errors
    /// * `RemoteInvocation` - the request could not be delivered
    /// * `Protocol` - the reply was not a result envelope
    /// * `Timeout` - no reply within `timeout-ms`
    /// * `Management` - the remote registry raised an error
    pub async fn invoke(&self, request: Request) -> Result<Value> {
        let method = request.method_name();
        let metrics = self.supervisor.metrics().clone();
        metrics.requests_sent.inc();

        let result = self.round_trip(request).await;
        match &result {
            Ok(_) | Err(Error::Management(_)) => {}
            Err(Error::Timeout(after)) => {
                metrics.requests_timed_out.inc();
                debug!("{} got no reply within {:?}", method, after);
            }
            Err(e) => {
                metrics.requests_failed.inc();
                debug!("{} failed: {}", method, e);
            }
        }
        result
    }

    async fn round_trip(&self, request: Request) -> Result<Value> {
        let body = self.codec.encode(&Envelope::Invocation(request))?;
        let conn = self.supervisor.connect().await?;
        let session = conn.create_session().await.map_err(undeliverable)?;

        let outcome = self.exchange(&conn, &session, body).await;
        session.close().await;
        outcome
    }

    async fn exchange(
        &self,
        conn: &Arc<ManagedConnection>,
        session: &Arc<dyn Session>,
        body: String,
    ) -> Result<Value> {
        let target = self
            .supervisor
            .target_destination(conn)
            .await
            .map_err(from_supervisor)?;
        let reply_to = self
            .supervisor
            .create_temporary_destination(conn)
            .await
            .map_err(from_supervisor)?;

        let outcome = self.send_and_wait(session, &target, &reply_to, body).await;
        self.supervisor.delete_temporary_destination(&reply_to).await;
        outcome
    }

    async fn send_and_wait(
        &self,
        session: &Arc<dyn Session>,
        target: &Destination,
        reply_to: &Destination,
        body: String,
    ) -> Result<Value> {
        // Listen before sending so a fast reply cannot be missed
        let mut consumer = session
            .create_consumer(reply_to)
            .await
            .map_err(undeliverable)?;

        let outcome = match self.send(session, target, reply_to, body).await {
            Ok(()) => self.await_reply(consumer.as_mut()).await,
            Err(e) => Err(e),
        };
        consumer.close().await;
        outcome
    }

    async fn send(
        &self,
        session: &Arc<dyn Session>,
        target: &Destination,
        reply_to: &Destination,
        body: String,
    ) -> Result<()> {
        let producer = session
            .create_producer(target)
            .await
            .map_err(undeliverable)?;
        let mut message = Message::text(body);
        message.set_reply_to(reply_to);

        trace!("Sending request to {} (reply to {})", target, reply_to);
        let sent = producer.send(message).await;
        producer.close().await;
        sent.map_err(undeliverable)
    }

    async fn await_reply(&self, consumer: &mut dyn Consumer) -> Result<Value> {
        let timeout = self.supervisor.environment().receive_timeout;
        let received = if timeout.is_zero() {
            consumer.receive().await
        } else {
            tokio::time::timeout(timeout, consumer.receive())
                .await
                .map_err(|_| Error::Timeout(timeout))?
        };

        let message = received.ok_or_else(|| {
            Error::RemoteInvocation("reply channel closed before a reply arrived".to_string())
        })?;
        match self.codec.decode(&message.body) {
            Ok(Envelope::Result(result)) => result.into_result(),
            Ok(other) => Err(Error::Protocol(format!(
                "expected a result envelope, got {}",
                other.kind()
            ))),
            Err(e) => Err(Error::Protocol(e.to_string())),
        }
    }
}
