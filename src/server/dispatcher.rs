//! Request dispatch.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{Envelope, MessageCodec};
use crate::error::{Error, Result};
use crate::protocol::{self, InvocationResult, RelayedResourceServer};
use crate::registry::ManagementError;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{Consumer, Destination, Message, Session};

struct Subscription {
    target: Destination,
    session: Arc<dyn Session>,
    consumer: Box<dyn Consumer>,
}

impl Subscription {
    async fn close(mut self) {
        self.consumer.close().await;
        self.session.close().await;
    }
}

/// Serves requests arriving on the service destination, one at a time.
///
/// When the consumer ends (connection lost) the dispatcher subscribes
/// again on the next connection the supervisor hands out.
pub struct ServiceDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    codec: Arc<dyn MessageCodec>,
    target: Arc<dyn RelayedResourceServer>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDispatcher {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        codec: Arc<dyn MessageCodec>,
        target: Arc<dyn RelayedResourceServer>,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            supervisor,
            codec,
            target,
            stop,
            task: Mutex::new(None),
        })
    }

    /// Subscribe to the service destination and start serving.
    ///
    /// Returns once the first subscription is in place, so requests sent
    /// afterwards are seen even on a topic.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.task.lock().is_some() {
            return Ok(());
        }
        let subscription = self.subscribe().await?;
        let task = tokio::spawn(self.clone().run(subscription));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop serving and wait for the current request to finish.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let conn = self.supervisor.connect().await?;
        let session = conn.create_session().await?;
        let subscribed = async {
            let target = self.supervisor.target_destination(&conn).await?;
            let consumer = session.create_consumer(&target).await?;
            Ok::<_, Error>((target, consumer))
        }
        .await;

        match subscribed {
            Ok((target, consumer)) => {
                debug!("Serving requests on {}", target);
                Ok(Subscription {
                    target,
                    session,
                    consumer,
                })
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Subscribe again, retrying until it works or the dispatcher stops.
    async fn resubscribe(&self, stop: &mut watch::Receiver<bool>) -> Option<Subscription> {
        loop {
            let attempt = tokio::select! {
                result = self.subscribe() => result,
                _ = stop.wait_for(|stopped| *stopped) => return None,
            };
            match attempt {
                Ok(subscription) => return Some(subscription),
                Err(Error::Interrupted) => return None,
                Err(e) => trace!("Resubscribing to the service destination failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.supervisor.retry_interval()) => {}
                _ = stop.wait_for(|stopped| *stopped) => return None,
            }
        }
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription) {
        let mut stop = self.stop.subscribe();

        loop {
            let received = tokio::select! {
                message = subscription.consumer.receive() => Some(message),
                _ = stop.wait_for(|stopped| *stopped) => None,
            };
            match received {
                Some(Some(message)) => self.handle(&subscription.session, message).await,
                Some(None) => {
                    debug!("Request consumer on {} ended", subscription.target);
                    subscription.close().await;
                    match self.resubscribe(&mut stop).await {
                        Some(next) => subscription = next,
                        None => return,
                    }
                }
                None => {
                    subscription.close().await;
                    return;
                }
            }
        }
    }

    async fn handle(&self, session: &Arc<dyn Session>, message: Message) {
        let metrics = self.supervisor.metrics();
        let kind = self.supervisor.environment().destination_kind;

        let reply_to = match kind.reply_destination(session.as_ref(), &message).await {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                warn!("Dropping request without a reply destination");
                metrics.requests_dropped.inc();
                return;
            }
            Err(e) => {
                warn!("Dropping request, reply destination unusable: {}", e);
                metrics.requests_dropped.inc();
                return;
            }
        };

        let request = match self.codec.decode(&message.body) {
            Ok(Envelope::Invocation(request)) => request,
            Ok(other) => {
                warn!("Dropping unexpected {} envelope", other.kind());
                metrics.requests_dropped.inc();
                return;
            }
            Err(e) => {
                warn!("Dropping undecodable request: {}", e);
                metrics.requests_dropped.inc();
                return;
            }
        };

        let method = request.method_name();
        trace!("Dispatching {} (reply to {})", method, reply_to);
        let result = protocol::execute(self.target.as_ref(), request).await;

        let body = match self.codec.encode(&Envelope::Result(result)) {
            Ok(body) => body,
            Err(e) => {
                let fallback = InvocationResult::Exception(ManagementError::NotSerializable(
                    e.to_string(),
                ));
                match self.codec.encode(&Envelope::Result(fallback)) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Dropping {} reply: {}", method, e);
                        metrics.requests_dropped.inc();
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.reply(session, &reply_to, body).await {
            warn!("Could not send {} reply to {}: {}", method, reply_to, e);
            metrics.requests_dropped.inc();
            return;
        }
        metrics.requests_dispatched.inc();
    }

    async fn reply(
        &self,
        session: &Arc<dyn Session>,
        reply_to: &Destination,
        body: String,
    ) -> Result<()> {
        let producer = session.create_producer(reply_to).await?;
        let sent = producer.send(Message::text(body)).await;
        producer.close().await;
        Ok(sent?)
    }
}
