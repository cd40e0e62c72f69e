use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::debug;

use crate::{
    broker::Broker,
    dispatch::{
        message::{RentalDispatch, StopDispatch, TerminateDispatch},
        queue::DispatchQueue,
    },
    error::RelayError,
    events::{ChainEvent, EventPayload},
};

/// Publish seam between the watcher and the queue layer.
///
/// The watcher only ever dispatches through this trait, which keeps its
/// dedupe, ordering and checkpoint logic testable without a live broker.
pub trait EventSink: Send + Sync + 'static {
    /// Publishes `event` to the queue(s) it maps onto. Must not return `Ok`
    /// unless every resulting message was confirmed by the broker.
    fn dispatch(&self, event: &ChainEvent) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// Maps normalized chain events onto the three dispatch queues.
///
/// * `Rented` → rental queue, plus a terminate message scheduled for the
///   rental's expiry instant. The broker holds the terminate message until
///   `willBeEndOn`, so no separate scheduler process exists.
/// * `Stopped` → stop queue.
/// * `Terminated` → terminate queue, immediate.
///
/// The two publishes for a `Rented` event are confirmed independently, not
/// atomically. If the scheduled terminate fails after the rental was
/// confirmed, the watcher retries the whole event and the rental message is
/// published a second time. Queue consumers are required to be idempotent
/// (see [`DispatchQueue::consume`]), which covers this case.
#[derive(Debug)]
pub struct EventRouter {
    rental: DispatchQueue<RentalDispatch>,
    stop: DispatchQueue<StopDispatch>,
    terminate: DispatchQueue<TerminateDispatch>,
}

impl EventRouter {
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            rental: DispatchQueue::rental(Arc::clone(&broker)),
            stop: DispatchQueue::stop(Arc::clone(&broker)),
            terminate: DispatchQueue::terminate(broker),
        }
    }
}

impl EventSink for EventRouter {
    async fn dispatch(&self, event: &ChainEvent) -> Result<(), RelayError> {
        match &event.payload {
            EventPayload::Rented(rented) => {
                self.rental.publish(&RentalDispatch::from(rented)).await?;

                let expiry =
                    SystemTime::UNIX_EPOCH + Duration::from_secs(rented.will_be_end_on);
                self.terminate.publish_at(&TerminateDispatch::from(rented), expiry).await?;
                debug!(
                    nft_id = %rented.nft_id,
                    terminate_on = rented.will_be_end_on,
                    "Rental dispatched, termination scheduled"
                );
            }
            EventPayload::Stopped(stopped) => {
                self.stop.publish(&StopDispatch::from(stopped)).await?;
            }
            EventPayload::Terminated(terminated) => {
                self.terminate.publish(&TerminateDispatch::from(terminated)).await?;
            }
        }
        Ok(())
    }
}
