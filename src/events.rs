//! Contract interface and normalized event records.
//!
//! The OrbitSphere contract emits three event kinds over the lifetime of a
//! rental. Only `nftId` and `tenant` are indexed: indexed dynamic fields carry
//! nothing but their keccak hash on the wire, and downstream workers need the
//! actual region / instance type / SSH key values.

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol,
    sol_types::SolEvent,
};

use crate::error::RelayError;

sol! {
    /// A tenant rented a compute instance.
    #[derive(Debug)]
    event InstanceRented(
        uint256 indexed nftId,
        address indexed tenant,
        string region,
        string instanceType,
        string sshPublicKey,
        uint256 rentedOn,
        uint256 willBeEndOn,
        uint256 totalCost,
        uint256 pricePerHour
    );

    /// A tenant stopped a running instance.
    #[derive(Debug)]
    event InstanceStopped(uint256 indexed nftId, address indexed tenant);

    /// A rental ended and the instance was reclaimed.
    #[derive(Debug)]
    event InstanceTerminated(
        uint256 indexed nftId,
        address indexed tenant,
        uint256 actualCost,
        uint256 timeConsumed,
        uint256 refundAmount
    );
}

/// Topic-0 hashes of the three watched event signatures, used to build the
/// subscription and catch-up log filters.
#[must_use]
pub fn watched_signatures() -> [B256; 3] {
    [
        InstanceRented::SIGNATURE_HASH,
        InstanceStopped::SIGNATURE_HASH,
        InstanceTerminated::SIGNATURE_HASH,
    ]
}

/// Chain provenance of an observed event, immutable once mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
}

/// The three watched event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Rented,
    Stopped,
    Terminated,
}

/// Identity of one event instance.
///
/// `(kind, nft_id, block)` uniquely identifies an event; overlapping live and
/// catch-up windows are de-duplicated on this key before publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    pub kind: EventKind,
    pub nft_id: U256,
    pub block: u64,
}

/// A normalized, decoded contract event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEvent {
    pub block: BlockRef,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Rented(RentedEvent),
    Stopped(StoppedEvent),
    Terminated(TerminatedEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RentedEvent {
    pub nft_id: U256,
    pub tenant: Address,
    pub region: String,
    pub instance_type: String,
    pub ssh_public_key: String,
    pub rented_on: u64,
    pub will_be_end_on: u64,
    pub total_cost: U256,
    pub price_per_hour: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoppedEvent {
    pub nft_id: U256,
    pub tenant: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminatedEvent {
    pub nft_id: U256,
    pub tenant: Address,
    pub actual_cost: U256,
    pub time_consumed: u64,
    pub refund_amount: U256,
}

impl ChainEvent {
    /// Decodes a raw log into a normalized event.
    ///
    /// Returns `Ok(None)` for logs whose signature is not one of the three
    /// watched kinds (the filters exclude them, but a foreign log is not an
    /// error).
    ///
    /// # Errors
    ///
    /// * [`RelayError::MissingBlockInfo`] if the log carries no block number or
    ///   hash (pending log).
    /// * [`RelayError::Abi`] if the body does not decode against the interface.
    pub fn try_from_log(log: &Log) -> Result<Option<Self>, RelayError> {
        let Some(topic0) = log.topic0().copied() else {
            return Ok(None);
        };

        let number = log.block_number.ok_or(RelayError::MissingBlockInfo)?;
        let hash = log.block_hash.ok_or(RelayError::MissingBlockInfo)?;
        let block = BlockRef { number, hash };

        let payload = if topic0 == InstanceRented::SIGNATURE_HASH {
            let data = log.log_decode::<InstanceRented>()?.inner.data;
            EventPayload::Rented(RentedEvent {
                nft_id: data.nftId,
                tenant: data.tenant,
                region: data.region,
                instance_type: data.instanceType,
                ssh_public_key: data.sshPublicKey,
                rented_on: data.rentedOn.saturating_to(),
                will_be_end_on: data.willBeEndOn.saturating_to(),
                total_cost: data.totalCost,
                price_per_hour: data.pricePerHour,
            })
        } else if topic0 == InstanceStopped::SIGNATURE_HASH {
            let data = log.log_decode::<InstanceStopped>()?.inner.data;
            EventPayload::Stopped(StoppedEvent { nft_id: data.nftId, tenant: data.tenant })
        } else if topic0 == InstanceTerminated::SIGNATURE_HASH {
            let data = log.log_decode::<InstanceTerminated>()?.inner.data;
            EventPayload::Terminated(TerminatedEvent {
                nft_id: data.nftId,
                tenant: data.tenant,
                actual_cost: data.actualCost,
                time_consumed: data.timeConsumed.saturating_to(),
                refund_amount: data.refundAmount,
            })
        } else {
            return Ok(None);
        };

        Ok(Some(Self { block, payload }))
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Rented(_) => EventKind::Rented,
            EventPayload::Stopped(_) => EventKind::Stopped,
            EventPayload::Terminated(_) => EventKind::Terminated,
        }
    }

    #[must_use]
    pub fn nft_id(&self) -> U256 {
        match &self.payload {
            EventPayload::Rented(e) => e.nft_id,
            EventPayload::Stopped(e) => e.nft_id,
            EventPayload::Terminated(e) => e.nft_id,
        }
    }

    /// The dedupe identity of this event instance.
    #[must_use]
    pub fn id(&self) -> EventId {
        EventId { kind: self.kind(), nft_id: self.nft_id(), block: self.block.number }
    }
}
