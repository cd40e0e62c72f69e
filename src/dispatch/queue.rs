use std::{
    marker::PhantomData,
    sync::Arc,
    time::SystemTime,
};

use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use serde::{Serialize, de::DeserializeOwned};
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use crate::{
    broker::{
        Broker, RENTAL_QUEUE, ROUTE_TO_RENTAL_QUEUE, ROUTE_TO_STOP_QUEUE,
        ROUTE_TO_TERMINATE_QUEUE, STOP_QUEUE, TERMINATE_QUEUE,
    },
    dispatch::message::{RentalDispatch, StopDispatch, TerminateDispatch},
    error::RelayError,
};

/// Error type returned by consumer handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Static description of one logical queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueSpec {
    pub queue: &'static str,
    pub routing_key: &'static str,
    /// Whether messages may be scheduled for future delivery on this queue.
    pub delayed: bool,
}

/// Typed façade over one queue of the shared exchange.
///
/// All façades share the process-wide [`Broker`]: closing one closes the
/// connection for all of them.
#[derive(Debug)]
pub struct DispatchQueue<M> {
    broker: Arc<Broker>,
    spec: QueueSpec,
    _payload: PhantomData<fn(M)>,
}

impl DispatchQueue<RentalDispatch> {
    #[must_use]
    pub fn rental(broker: Arc<Broker>) -> Self {
        Self::with_spec(
            broker,
            QueueSpec { queue: RENTAL_QUEUE, routing_key: ROUTE_TO_RENTAL_QUEUE, delayed: false },
        )
    }
}

impl DispatchQueue<StopDispatch> {
    #[must_use]
    pub fn stop(broker: Arc<Broker>) -> Self {
        Self::with_spec(
            broker,
            QueueSpec { queue: STOP_QUEUE, routing_key: ROUTE_TO_STOP_QUEUE, delayed: false },
        )
    }
}

impl DispatchQueue<TerminateDispatch> {
    #[must_use]
    pub fn terminate(broker: Arc<Broker>) -> Self {
        Self::with_spec(
            broker,
            QueueSpec {
                queue: TERMINATE_QUEUE,
                routing_key: ROUTE_TO_TERMINATE_QUEUE,
                delayed: true,
            },
        )
    }
}

impl<M> DispatchQueue<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn with_spec(broker: Arc<Broker>, spec: QueueSpec) -> Self {
        Self { broker, spec, _payload: PhantomData }
    }

    /// Publishes `message` for immediate routing.
    ///
    /// Returns once the broker confirms the publish.
    ///
    /// # Errors
    ///
    /// * [`RelayError::PublishRejected`] if the broker nacks the publish.
    /// * [`RelayError::BrokerUnavailable`] if the connection cannot be
    ///   established.
    pub async fn publish(&self, message: &M) -> Result<(), RelayError> {
        let payload = serde_json::to_vec(message)?;
        self.broker.publish(self.spec.routing_key, &payload, 0).await?;
        debug!(queue = self.spec.queue, "Published message");
        Ok(())
    }

    /// Publishes `message` for delivery at `deliver_at`.
    ///
    /// The broker withholds routing until the instant is reached; an instant
    /// in the past routes immediately.
    ///
    /// # Errors
    ///
    /// * [`RelayError::DelayNotSupported`] if this queue is not
    ///   delay-capable.
    /// * Publish errors as in [`DispatchQueue::publish`].
    pub async fn publish_at(&self, message: &M, deliver_at: SystemTime) -> Result<(), RelayError> {
        if !self.spec.delayed {
            return Err(RelayError::DelayNotSupported(self.spec.queue));
        }
        let payload = serde_json::to_vec(message)?;
        let delay = delay_millis(deliver_at, SystemTime::now());
        self.broker.publish(self.spec.routing_key, &payload, delay).await?;
        debug!(queue = self.spec.queue, delay_ms = delay, "Published delayed message");
        Ok(())
    }

    /// Consumes messages from this queue, invoking `handler` once per
    /// delivery.
    ///
    /// A delivery is acknowledged only if `handler` returns `Ok`; on handler
    /// failure (including a payload that does not deserialize) the message
    /// is returned to the broker for redelivery. Delivery is therefore
    /// at-least-once and handlers must be idempotent. Queues with poison
    /// messages should be configured with a dead-letter exchange.
    ///
    /// Runs until the channel closes or the service shuts down.
    ///
    /// # Errors
    ///
    /// * [`RelayError::BrokerUnavailable`] if the connection cannot be
    ///   established.
    /// * [`RelayError::Broker`] on channel failures while consuming.
    pub async fn consume<F, Fut>(&self, handler: F) -> Result<(), RelayError>
    where
        F: Fn(M) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), HandlerError>> + Send,
    {
        let channel = self.broker.channel().await?;
        let mut consumer = channel
            .basic_consume(
                self.spec.queue,
                &format!("{}-consumer", self.spec.queue.to_lowercase()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;

            let outcome = match serde_json::from_slice::<M>(&delivery.data) {
                Ok(message) => handler(message).await,
                Err(e) => {
                    // Treated the same as a handler failure: the message is
                    // never dropped silently.
                    error!(queue = self.spec.queue, error = %e, "Undecodable message");
                    Err(e.into())
                }
            };

            match outcome {
                Ok(()) => delivery.acker.ack(BasicAckOptions::default()).await?,
                Err(e) => {
                    warn!(queue = self.spec.queue, error = %e, "Handler failed, requeueing");
                    delivery
                        .acker
                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Closes the underlying broker connection.
    ///
    /// Process-wide: every façade sharing the broker stops working.
    ///
    /// # Errors
    ///
    /// Returns the underlying close error, if any.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.broker.shutdown().await
    }
}

/// Milliseconds to withhold a message so it routes at `deliver_at`, clamped to
/// zero for instants in the past.
fn delay_millis(deliver_at: SystemTime, now: SystemTime) -> i64 {
    deliver_at
        .duration_since(now)
        .map_or(0, |ahead| i64::try_from(ahead.as_millis()).unwrap_or(i64::MAX))
}
