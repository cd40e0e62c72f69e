use std::{ops::RangeInclusive, pin::Pin, time::Duration};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::Address,
    providers::{Provider, RootProvider},
    rpc::types::{Filter, Log},
    transports::{RpcError, TransportErrorKind},
};
use backon::{ExponentialBuilder, Retryable};
use tokio_stream::Stream;
use tracing::info;

use crate::{
    error::RelayError,
    events::{BlockRef, watched_signatures},
};

/// A live stream of raw contract logs.
pub type LogStream = Pin<Box<dyn Stream<Item = Log> + Send>>;

/// RPC seam consumed by the watcher.
///
/// The production implementation is [`RpcChain`]; tests script a fake so the
/// dedupe, ordering and checkpoint logic runs without a live node.
pub trait ChainReader: Send + Sync + 'static {
    /// Current chain head.
    fn head(&self) -> impl Future<Output = Result<BlockRef, RelayError>> + Send;

    /// Watched-event logs over an inclusive block range.
    fn logs(
        &self,
        range: RangeInclusive<u64>,
    ) -> impl Future<Output = Result<Vec<Log>, RelayError>> + Send;

    /// Opens a live subscription to watched-event logs.
    fn subscribe(&self) -> impl Future<Output = Result<LogStream, RelayError>> + Send;
}

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// [`ChainReader`] over a WebSocket provider, with exponential-backoff retries
/// on transient RPC failures.
#[derive(Debug, Clone)]
pub struct RpcChain {
    provider: RootProvider,
    contract_address: Address,
    max_retries: usize,
    min_retry_delay: Duration,
}

impl RpcChain {
    #[must_use]
    pub fn new(provider: RootProvider, contract_address: Address) -> Self {
        Self {
            provider,
            contract_address,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn base_filter(&self) -> Filter {
        Filter::new().address(self.contract_address).event_signature(watched_signatures().to_vec())
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, RelayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_retry_delay);

        operation
            .retry(strategy)
            .notify(|err: &RpcError<TransportErrorKind>, dur: Duration| {
                info!(error = %err, "RPC error, retrying after {:?}", dur);
            })
            .sleep(tokio::time::sleep)
            .await
            .map_err(RelayError::from)
    }
}

impl ChainReader for RpcChain {
    async fn head(&self) -> Result<BlockRef, RelayError> {
        let number = self.with_retry(|| async { self.provider.get_block_number().await }).await?;
        let block = self
            .with_retry(|| async {
                self.provider.get_block_by_number(BlockNumberOrTag::Number(number)).await
            })
            .await?
            .ok_or(RelayError::BlockNotFound(number))?;
        Ok(BlockRef { number: block.header.number, hash: block.header.hash })
    }

    async fn logs(&self, range: RangeInclusive<u64>) -> Result<Vec<Log>, RelayError> {
        let filter = self.base_filter().from_block(*range.start()).to_block(*range.end());
        self.with_retry(|| async { self.provider.get_logs(&filter).await }).await
    }

    async fn subscribe(&self) -> Result<LogStream, RelayError> {
        let subscription = self.provider.subscribe_logs(&self.base_filter()).await?;
        Ok(Box::pin(subscription.into_stream()))
    }
}
