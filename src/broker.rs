//! Broker topology manager.
//!
//! Owns the single AMQP connection and channel for the process. Every queue
//! façade publishes and consumes through one [`Broker`]; closing it tears the
//! whole broker side of the process down.
//!
//! The exchange is declared as `x-delayed-message` with direct routing
//! underneath, so a message published with an `x-delay` header is withheld by
//! the broker until the delay elapses. A broker without the delayed-message
//! plugin fails initialization, since terminate scheduling depends on it.

use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RelayError;

/// The shared delayed-direct exchange.
pub const ORBITSPHERE_EXCHANGE: &str = "ORBITSPHERE_EXCHANGE";

pub const RENTAL_QUEUE: &str = "RENTAL_QUEUE";
pub const STOP_QUEUE: &str = "STOP_QUEUE";
pub const TERMINATE_QUEUE: &str = "TERMINATE_QUEUE";

pub const ROUTE_TO_RENTAL_QUEUE: &str = "ROUTE_TO_RENTAL_QUEUE";
pub const ROUTE_TO_STOP_QUEUE: &str = "ROUTE_TO_STOP_QUEUE";
pub const ROUTE_TO_TERMINATE_QUEUE: &str = "ROUTE_TO_TERMINATE_QUEUE";

const DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

struct BrokerState {
    connection: Connection,
    channel: Channel,
}

/// Process-wide broker connection, channel and topology.
///
/// Connects lazily on first use; [`Broker::ensure_ready`] is idempotent.
/// Publishes are serialized through the internal mutex (single-writer
/// discipline on the shared channel), so concurrent publishers queue rather
/// than race. Retry policy on connection failure belongs to the caller.
pub struct Broker {
    url: String,
    state: Mutex<Option<BrokerState>>,
}

impl Broker {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), state: Mutex::new(None) }
    }

    /// Connects and declares the exchange, queues and bindings if not already
    /// done. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// * [`RelayError::BrokerUnavailable`] if the connection or channel cannot
    ///   be established.
    /// * [`RelayError::UnsupportedBrokerFeature`] if the delayed-message
    ///   exchange cannot be declared.
    pub async fn ensure_ready(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        *state = Some(self.connect_and_declare().await?);
        Ok(())
    }

    async fn connect_and_declare(&self) -> Result<BrokerState, RelayError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(RelayError::BrokerUnavailable)?;
        let channel =
            connection.create_channel().await.map_err(RelayError::BrokerUnavailable)?;

        // Publisher confirms: `publish` resolves only once the broker has
        // taken responsibility for the message.
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let mut exchange_args = FieldTable::default();
        exchange_args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
        channel
            .exchange_declare(
                ORBITSPHERE_EXCHANGE,
                ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE.into()),
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                exchange_args,
            )
            .await
            .map_err(|source| RelayError::UnsupportedBrokerFeature {
                feature: DELAYED_MESSAGE_EXCHANGE,
                source,
            })?;

        for (queue, routing_key) in [
            (RENTAL_QUEUE, ROUTE_TO_RENTAL_QUEUE),
            (STOP_QUEUE, ROUTE_TO_STOP_QUEUE),
            (TERMINATE_QUEUE, ROUTE_TO_TERMINATE_QUEUE),
        ] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    ORBITSPHERE_EXCHANGE,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(queue, routing_key, "Queue bound to exchange");
        }

        info!(exchange = ORBITSPHERE_EXCHANGE, "Broker topology ready");
        Ok(BrokerState { connection, channel })
    }

    /// Publishes `payload` to the shared exchange and waits for the broker's
    /// confirmation. `delay_ms > 0` sets the `x-delay` header so the broker
    /// withholds routing until the delay elapses.
    ///
    /// # Errors
    ///
    /// * [`RelayError::PublishRejected`] if the broker nacks the publish.
    /// * Connection errors as in [`Broker::ensure_ready`].
    pub async fn publish(
        &self,
        routing_key: &'static str,
        payload: &[u8],
        delay_ms: i64,
    ) -> Result<(), RelayError> {
        self.ensure_ready().await?;

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            // survive broker restarts
            .with_delivery_mode(2);
        if delay_ms > 0 {
            let mut headers = FieldTable::default();
            headers.insert("x-delay".into(), AMQPValue::LongLongInt(delay_ms));
            properties = properties.with_headers(headers);
        }

        // Single-writer discipline: the lock is held across the publish and
        // its confirmation.
        let state = self.state.lock().await;
        let Some(state) = state.as_ref() else {
            return Err(RelayError::ServiceShutdown);
        };

        let confirmation = state
            .channel
            .basic_publish(
                ORBITSPHERE_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(RelayError::PublishRejected { routing_key }),
            _ => Ok(()),
        }
    }

    /// Returns the shared channel for registering consumers.
    ///
    /// # Errors
    ///
    /// Connection errors as in [`Broker::ensure_ready`].
    pub async fn channel(&self) -> Result<Channel, RelayError> {
        self.ensure_ready().await?;
        let state = self.state.lock().await;
        state.as_ref().map(|s| s.channel.clone()).ok_or(RelayError::ServiceShutdown)
    }

    /// Closes the channel, then the connection.
    ///
    /// This tears down the broker side for the whole process: every queue
    /// façade sharing this `Broker` stops working. A no-op if never connected.
    ///
    /// # Errors
    ///
    /// Returns the underlying close error, if any.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if let Some(state) = state.take() {
            state.channel.close(200, "shutdown").await?;
            state.connection.close(200, "shutdown").await?;
            info!("Broker connection closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("url", &self.url).finish_non_exhaustive()
    }
}
