//! Broker side of the relay: connection lifecycle, queue consumption and
//! per-message acknowledgement.
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::fanout::{DispatchReport, FanOut};
use crate::model::{ConnectionState, ContentPublishedEvent};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker unreachable after {attempts} attempts: {last}")]
    BrokerUnreachable { attempts: u32, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Run `connect` until it succeeds, sleeping `backoff` between failures.
/// Gives up with `BrokerUnreachable` after `attempts` failures.
pub async fn connect_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut connect: F,
) -> Result<T, ConsumerError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut last = String::new();
    for attempt in 1..=policy.attempts {
        match connect(attempt).await {
            Ok(conn) => {
                if attempt > 1 {
                    info!(attempt, "connected to broker after retry");
                }
                return Ok(conn);
            }
            Err(err) => {
                let attempts_left = policy.attempts - attempt;
                warn!(%err, attempt, attempts_left, "broker session setup failed");
                last = err.to_string();
                if attempts_left > 0 {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
    Err(ConsumerError::BrokerUnreachable {
        attempts: policy.attempts,
        last,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Shutdown,
    Event(ContentPublishedEvent),
    Malformed(String),
}

/// Classify a raw message body. Any body mentioning the queue's own name is the
/// shutdown sentinel; everything else must be a JSON event.
pub fn decode(queue: &str, body: &[u8]) -> Decoded {
    if String::from_utf8_lossy(body).contains(queue) {
        return Decoded::Shutdown;
    }
    match serde_json::from_slice::<ContentPublishedEvent>(body) {
        Ok(event) => Decoded::Event(event),
        Err(err) => Decoded::Malformed(err.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack(DispatchReport),
    DeadLetter(String),
    Shutdown,
}

/// Decode one delivery and run the fan-out for it.
#[instrument(skip_all)]
pub async fn process_payload(fanout: &FanOut, queue: &str, body: &[u8]) -> Disposition {
    match decode(queue, body) {
        Decoded::Shutdown => Disposition::Shutdown,
        Decoded::Malformed(reason) => {
            warn!(%reason, len = body.len(), "malformed event");
            Disposition::DeadLetter(reason)
        }
        Decoded::Event(event) => {
            info!(
                creator_id = event.creator_id,
                content_id = event.content_id,
                "new content event"
            );
            Disposition::Ack(fanout.dispatch(event).await)
        }
    }
}

pub fn dead_letter_envelope(queue: &str, body: &[u8], reason: &str) -> Vec<u8> {
    serde_json::json!({
        "reason": reason,
        "queue": queue,
        "payload": String::from_utf8_lossy(body),
    })
    .to_string()
    .into_bytes()
}

/// One message taken off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

/// An open consuming session: connection, channel, declared queues and an
/// active consumer.
#[async_trait]
pub trait BrokerSession: Send {
    /// `None` when the broker ends the delivery stream.
    async fn next(&mut self) -> Option<anyhow::Result<Incoming>>;
    async fn ack(&mut self, delivery_tag: u64) -> anyhow::Result<()>;
    async fn dead_letter(&mut self, payload: &[u8]) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens a session. Every step up to the first delivery is one attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self) -> anyhow::Result<Box<dyn BrokerSession>>;
}

#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    queue: String,
    dead_letter_queue: String,
    durable: bool,
    prefetch: u16,
    consumer_tag: String,
}

impl AmqpConnector {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            url: cfg.broker.url.clone(),
            queue: cfg.broker.queue.clone(),
            dead_letter_queue: cfg.broker.dead_letter_queue(),
            durable: cfg.broker.durable,
            prefetch: cfg.broker.prefetch,
            consumer_tag: format!("tg-recipe-relay-{}", Uuid::new_v4()),
        }
    }

    async fn setup(&self, conn: &Connection) -> lapin::Result<(Channel, lapin::Consumer)> {
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: self.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &self.dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let deliveries = channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok((channel, deliveries))
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn open(&self) -> anyhow::Result<Box<dyn BrokerSession>> {
        let conn = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        match self.setup(&conn).await {
            Ok((channel, deliveries)) => Ok(Box::new(AmqpSession {
                conn,
                channel,
                deliveries,
                dead_letter_queue: self.dead_letter_queue.clone(),
            })),
            Err(err) => {
                if let Err(close_err) = conn.close(200, "queue setup failed").await {
                    debug!(%close_err, "closing half-open connection failed");
                }
                Err(err.into())
            }
        }
    }
}

struct AmqpSession {
    conn: Connection,
    channel: Channel,
    deliveries: lapin::Consumer,
    dead_letter_queue: String,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn next(&mut self) -> Option<anyhow::Result<Incoming>> {
        let delivery = self.deliveries.next().await?;
        Some(
            delivery
                .map(|d| Incoming {
                    delivery_tag: d.delivery_tag,
                    body: d.data,
                })
                .map_err(Into::into),
        )
    }

    async fn ack(&mut self, delivery_tag: u64) -> anyhow::Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let props = BasicProperties::default()
            .with_content_type("application/json".to_string().into())
            .with_delivery_mode(2)
            .with_message_id(Uuid::new_v4().to_string().into());
        self.channel
            .basic_publish(
                "",
                &self.dead_letter_queue,
                BasicPublishOptions::default(),
                payload,
                props,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.conn.close(200, "relay shutting down").await?;
        Ok(())
    }
}

enum SessionEnd {
    Stopped,
    Lost,
}

pub struct QueueConsumer {
    connector: Arc<dyn BrokerConnector>,
    queue: String,
    retry: RetryPolicy,
    fanout: FanOut,
    state: watch::Sender<ConnectionState>,
}

impl QueueConsumer {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        retry: RetryPolicy,
        fanout: FanOut,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            queue: queue.into(),
            retry,
            fanout,
            state,
        }
    }

    pub fn from_config(cfg: &Config, fanout: FanOut) -> Self {
        Self::new(
            Arc::new(AmqpConnector::from_config(cfg)),
            cfg.broker.queue.clone(),
            RetryPolicy {
                attempts: cfg.broker.connect_attempts,
                backoff: cfg.broker.connect_backoff(),
            },
            fanout,
        )
    }

    /// Follows the connection state; the current value is available right away.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(state = %state, queue = %self.queue, "connection state");
        }
    }

    /// Consume until the sentinel arrives or `shutdown` flips to true.
    /// Returns an error only when the broker stays unreachable.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        loop {
            self.set_state(ConnectionState::Connecting);
            let connector = self.connector.as_ref();
            let opening: Pin<
                Box<dyn Future<Output = Result<Box<dyn BrokerSession>, ConsumerError>> + Send + '_>,
            > = Box::pin(connect_with_retry(&self.retry, move |attempt| {
                debug!(attempt, "opening broker session");
                connector.open()
            }));
            let opened = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                res = opening => Some(res),
            };
            let mut session = match opened {
                None => {
                    self.set_state(ConnectionState::ShuttingDown);
                    return Ok(());
                }
                Some(Err(err)) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(err);
                }
                Some(Ok(session)) => session,
            };
            self.set_state(ConnectionState::Connected);

            match self.consume(session.as_mut(), &mut shutdown).await {
                Ok(SessionEnd::Stopped) => {
                    self.set_state(ConnectionState::ShuttingDown);
                    if let Err(err) = session.close().await {
                        warn!(%err, "failed to close broker connection");
                    }
                    return Ok(());
                }
                Ok(SessionEnd::Lost) => warn!("delivery stream ended"),
                Err(err) => warn!(%err, "broker session failed"),
            }
            drop(session);
            self.set_state(ConnectionState::Disconnected);

            debug!(backoff = ?self.retry.backoff, "waiting before reconnect");
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    self.set_state(ConnectionState::ShuttingDown);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.retry.backoff) => {}
            }
        }
    }

    async fn consume(
        &self,
        session: &mut dyn BrokerSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    info!("stop signal received");
                    return Ok(SessionEnd::Stopped);
                }
                next = session.next() => next,
            };
            let message = match next {
                None => return Ok(SessionEnd::Lost),
                Some(message) => message?,
            };

            match process_payload(&self.fanout, &self.queue, &message.body).await {
                Disposition::Shutdown => {
                    info!(queue = %self.queue, "shutdown sentinel received");
                    // acked so a restart does not stop on the same sentinel
                    session.ack(message.delivery_tag).await?;
                    return Ok(SessionEnd::Stopped);
                }
                Disposition::Ack(_) => {
                    session.ack(message.delivery_tag).await?;
                }
                Disposition::DeadLetter(reason) => {
                    let payload = dead_letter_envelope(&self.queue, &message.body, &reason);
                    match session.dead_letter(&payload).await {
                        Ok(()) => info!("malformed event dead-lettered"),
                        Err(err) => error!(%err, "dead-letter publish failed; dropping message"),
                    }
                    session.ack(message.delivery_tag).await?;
                }
            }
        }
    }
}

/// Resolves once the flag is set. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
