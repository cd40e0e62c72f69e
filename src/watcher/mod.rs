//! Chain event watcher.
//!
//! Guarantees that every watched contract event is eventually dispatched
//! exactly once. Two operating modes cooperate:
//!
//! * **Live mode** holds a log subscription and dispatches each event as it
//!   arrives, advancing the checkpoint after every confirmed publish.
//! * **Catch-up mode** runs on startup and after every subscription loss: it
//!   scans `(checkpoint, head]` in batches and republishes anything not yet
//!   dispatched.
//!
//! The subscription is opened *before* the scan, so logs arriving during
//! catch-up buffer in the subscription channel; the [`SeenSet`] suppresses the
//! overlap between the two paths. One task consumes both paths, so dispatch
//! order per instance follows chain order structurally.

mod chain;
mod seen;

pub use chain::{ChainReader, LogStream, RpcChain};

use std::collections::HashSet;

use alloy::{primitives::U256, rpc::types::Log};
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::{sync::watch, task::JoinHandle, time::Duration};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    dispatch::EventSink,
    error::RelayError,
    events::{BlockRef, ChainEvent},
    watcher::seen::SeenSet,
};

/// Upper bound on blocks fetched per historical `eth_getLogs` call.
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 1000;

/// Dedupe window, in blocks, behind the newest processed block. Covers the
/// handover overlap between a dropped subscription and the closing scan.
pub const DEFAULT_SEEN_WINDOW: u64 = 64;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Watches the contract and feeds the dispatch queues.
pub struct Watcher<R, S, C> {
    chain: R,
    sink: S,
    store: C,
    max_block_range: u64,
    seen_window: u64,
    start_block: Option<u64>,
}

impl<R, S, C> Watcher<R, S, C>
where
    R: ChainReader,
    S: EventSink,
    C: CheckpointStore,
{
    #[must_use]
    pub fn new(chain: R, sink: S, store: C) -> Self {
        Self {
            chain,
            sink,
            store,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
            seen_window: DEFAULT_SEEN_WINDOW,
            start_block: None,
        }
    }

    #[must_use]
    pub fn max_block_range(mut self, max_block_range: u64) -> Self {
        self.max_block_range = max_block_range;
        self
    }

    /// Block to scan from when no checkpoint exists yet. Without it, a first
    /// run anchors at the current head and dispatches nothing historical.
    #[must_use]
    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    /// Spawns the watcher service and returns its handle.
    #[must_use]
    pub fn start(self) -> WatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        WatcherHandle { shutdown: shutdown_tx, task }
    }

    /// Runs the watcher until `shutdown` flips or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns non-transient failures (e.g. checkpoint persistence errors).
    /// Transient chain and broker errors are retried internally.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut service = Service {
            chain: self.chain,
            sink: self.sink,
            store: self.store,
            seen: SeenSet::new(self.seen_window),
            max_block_range: self.max_block_range,
            start_block: self.start_block,
        };
        service.run(shutdown).await
    }
}

/// Control handle for a started [`Watcher`].
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl WatcherHandle {
    /// Signals shutdown and waits for the service to stop.
    ///
    /// The service only stops at a safe boundary (after a checkpoint write),
    /// never mid-batch.
    ///
    /// # Errors
    ///
    /// Returns the service's terminal error, if it failed.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|_| RelayError::ServiceShutdown)?
    }
}

enum ScanOutcome {
    Complete,
    Interrupted,
}

struct Service<R, S, C> {
    chain: R,
    sink: S,
    store: C,
    seen: SeenSet,
    max_block_range: u64,
    start_block: Option<u64>,
}

impl<R, S, C> Service<R, S, C>
where
    R: ChainReader,
    S: EventSink,
    C: CheckpointStore,
{
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        info!("Starting watcher service");
        let mut retry_delays = retry_backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Subscribe before scanning: logs emitted during the scan buffer
            // in the subscription channel instead of falling into the gap.
            let mut live = match self.chain.subscribe().await {
                Ok(stream) => stream,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Subscription failed, retrying");
                    tokio::time::sleep(retry_delays.next().unwrap_or(MAX_BACKOFF)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.catch_up_with_retry(&shutdown).await? {
                ScanOutcome::Interrupted => break,
                ScanOutcome::Complete => {}
            }
            retry_delays = retry_backoff();

            info!("Catch-up complete, streaming live events");
            let lost = loop {
                tokio::select! {
                    _ = shutdown.changed() => break false,
                    maybe_log = live.next() => match maybe_log {
                        Some(log) => match self.process_live(&log).await {
                            Ok(()) => {}
                            Err(e) if e.is_transient() => {
                                warn!(error = %e, "Live dispatch failed, resyncing");
                                break true;
                            }
                            Err(e) => return Err(e),
                        },
                        None => {
                            warn!("Live subscription closed");
                            break true;
                        }
                    }
                }
            };

            if !lost {
                break;
            }
            // a lost subscription is not fatal: loop back into catch-up to
            // close whatever gap the drop opened
        }

        info!("Watcher service stopped");
        Ok(())
    }

    async fn process_live(&mut self, log: &Log) -> Result<(), RelayError> {
        let event = match ChainEvent::try_from_log(log) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => {
                // never dropped silently, but a bad log must not kill the
                // healthy event streams
                error!(error = %e, "Undecodable live log, skipping");
                return Ok(());
            }
        };

        if self.seen.contains(&event.id()) {
            debug!(block = event.block.number, "Duplicate live event suppressed");
            return Ok(());
        }

        self.sink.dispatch(&event).await?;
        self.seen.insert(event.id());
        self.advance_checkpoint(event.block).await?;
        info!(block = event.block.number, nft_id = %event.nft_id(), "Live event dispatched");
        Ok(())
    }

    async fn catch_up_with_retry(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ScanOutcome, RelayError> {
        let mut retry_delays = retry_backoff();
        loop {
            if *shutdown.borrow() {
                return Ok(ScanOutcome::Interrupted);
            }
            match self.catch_up(shutdown).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Catch-up scan failed, retrying");
                    tokio::time::sleep(retry_delays.next().unwrap_or(MAX_BACKOFF)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scans `(checkpoint, head]` and dispatches every event not yet seen.
    ///
    /// The checkpoint never advances past the first failed publish, and later
    /// events for an instance that failed are skipped in the same scan so
    /// per-instance chain order survives the retry.
    async fn catch_up(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ScanOutcome, RelayError> {
        let head = self.chain.head().await?;
        let checkpoint = self.store.read().await?;

        let scan_from = match checkpoint {
            Some(cp) => cp.block_number + 1,
            None => match self.start_block {
                Some(block) => block,
                None => {
                    info!(head = head.number, "No checkpoint, anchoring at head");
                    self.advance_checkpoint(head).await?;
                    return Ok(ScanOutcome::Complete);
                }
            },
        };
        if scan_from > head.number {
            return Ok(ScanOutcome::Complete);
        }

        info!(from = scan_from, to = head.number, "Catch-up scan");

        let mut failed_instances: HashSet<U256> = HashSet::new();
        let mut first_error: Option<RelayError> = None;
        let mut failed_block: Option<u64> = None;
        let mut last_dispatched: Option<BlockRef> = None;

        let mut batch_start = scan_from;
        loop {
            let batch_end =
                batch_start.saturating_add(self.max_block_range.max(1) - 1).min(head.number);

            let mut logs = self.chain.logs(batch_start..=batch_end).await?;
            logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));

            for log in &logs {
                let event = match ChainEvent::try_from_log(log) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, "Undecodable historical log, skipping");
                        continue;
                    }
                };
                if failed_instances.contains(&event.nft_id()) {
                    // dispatching now would reorder this instance's stream;
                    // the next scan retries from before the failure
                    continue;
                }
                if self.seen.contains(&event.id()) {
                    debug!(block = event.block.number, "Already dispatched, skipping");
                    continue;
                }
                match self.sink.dispatch(&event).await {
                    Ok(()) => {
                        self.seen.insert(event.id());
                        // the checkpoint may only cover blocks strictly below
                        // the first failure; a failed event inside the
                        // checkpointed range would never be retried
                        if failed_block.is_none_or(|block| event.block.number < block) {
                            last_dispatched = Some(event.block);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, block = event.block.number, nft_id = %event.nft_id(), "Dispatch failed during catch-up");
                        failed_instances.insert(event.nft_id());
                        failed_block.get_or_insert(event.block.number);
                        // an earlier success in this same block must not
                        // checkpoint over the failure; the seen set keeps the
                        // retried scan from re-dispatching it
                        if last_dispatched.is_some_and(|b| b.number >= event.block.number) {
                            last_dispatched = None;
                        }
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Some(block) = last_dispatched.take() {
                self.advance_checkpoint(block).await?;
            }

            // batch boundary: the only place a scan may stop early
            if *shutdown.borrow() {
                return Ok(ScanOutcome::Interrupted);
            }
            if batch_end == head.number {
                break;
            }
            batch_start = batch_end + 1;
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.advance_checkpoint(head).await?;
        info!(head = head.number, "Catch-up scan finished");
        Ok(ScanOutcome::Complete)
    }

    async fn advance_checkpoint(&mut self, block: BlockRef) -> Result<(), RelayError> {
        let checkpoint = Checkpoint { block_number: block.number, block_hash: block.hash };
        match self.store.write(checkpoint).await {
            Ok(()) => {}
            Err(RelayError::CheckpointConflict { stored, proposed }) => {
                // another writer is ahead; nothing to do
                debug!(stored, proposed, "Checkpoint already ahead");
            }
            Err(e) => return Err(e),
        }
        // dedupe entries are only safe to forget once the checkpoint has
        // passed them, otherwise a retried scan would re-dispatch
        self.seen.prune_behind(block.number);
        Ok(())
    }
}

/// Delay sequence for scan and subscription retries. Once the sequence is
/// exhausted the caller falls back to [`MAX_BACKOFF`] and keeps retrying.
fn retry_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default().with_max_delay(MAX_BACKOFF).build()
}
