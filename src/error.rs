use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

/// Errors emitted by the relay.
///
/// Infrastructure errors (broker or chain connectivity, rejected publishes) are
/// transient and retried by the watcher; data errors (decode failures, ABI
/// mismatches) are not retried blindly and never crash the process.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The broker connection or channel could not be established.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[source] lapin::Error),

    /// The broker does not support a required capability, e.g. the
    /// delayed-message exchange plugin is not installed.
    #[error("broker lacks required feature `{feature}`: {source}")]
    UnsupportedBrokerFeature {
        feature: &'static str,
        #[source]
        source: lapin::Error,
    },

    /// The broker negatively acknowledged a publish. The message must be
    /// considered not delivered and the checkpoint must not advance past it.
    #[error("broker rejected publish to `{routing_key}`")]
    PublishRejected { routing_key: &'static str },

    /// A broker channel operation failed mid-flight.
    #[error("broker channel error: {0}")]
    Broker(#[from] lapin::Error),

    /// The underlying chain RPC transport returned an error.
    #[error("chain RPC error: {0}")]
    ChainRpc(#[from] RpcError<TransportErrorKind>),

    /// A consumed or published payload could not be (de)serialized.
    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A chain log matched one of the watched signatures but its body could
    /// not be decoded against the contract interface.
    #[error("log decode error: {0}")]
    Abi(#[from] alloy::sol_types::Error),

    /// A log was delivered without block provenance (pending log). Watched
    /// events are only valid once mined.
    #[error("log is missing block number or hash")]
    MissingBlockInfo,

    /// A compare-and-set checkpoint write would have regressed the stored
    /// block number. The caller must re-read and decide whether to skip.
    #[error("checkpoint write conflict: stored block {stored}, proposed {proposed}")]
    CheckpointConflict { stored: u64, proposed: u64 },

    /// Checkpoint persistence failed.
    #[error("checkpoint store I/O error: {0}")]
    CheckpointIo(#[from] std::io::Error),

    /// A delayed publish was attempted on a queue without delay capability.
    #[error("queue `{0}` does not support delayed delivery")]
    DelayNotSupported(&'static str),

    /// The requested block could not be retrieved from the chain node.
    #[error("block not found: {0}")]
    BlockNotFound(u64),

    /// The service is shutting down and no longer accepts work.
    #[error("service shutdown")]
    ServiceShutdown,
}

impl RelayError {
    /// Whether the error is expected to resolve on its own and the failed
    /// operation should be retried with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::BrokerUnavailable(_)
                | RelayError::PublishRejected { .. }
                | RelayError::Broker(_)
                | RelayError::ChainRpc(_)
                | RelayError::BlockNotFound(_)
        )
    }
}
