//! Wire payloads.
//!
//! Field names are part of the contract with downstream workers and must not
//! change. `nftId` is the decimal string form of the token id; delivery delay
//! is conveyed via the `x-delay` broker header, never in the payload body.

use serde::{Deserialize, Serialize};

use crate::events::{RentedEvent, StoppedEvent, TerminatedEvent};

/// Instructs a provisioning worker to bring up an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalDispatch {
    pub tenant: String,
    pub region: String,
    pub ssh_public_key: String,
    pub instance_type: String,
    pub nft_id: String,
    /// Unix timestamp (seconds) at which the rental expires.
    pub terminate_on: u64,
}

/// Instructs a worker to stop a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDispatch {
    pub tenant: String,
    pub nft_id: String,
}

/// Instructs a worker to terminate and reclaim an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateDispatch {
    pub tenant: String,
    pub nft_id: String,
}

impl From<&RentedEvent> for RentalDispatch {
    fn from(event: &RentedEvent) -> Self {
        Self {
            tenant: event.tenant.to_string(),
            region: event.region.clone(),
            ssh_public_key: event.ssh_public_key.clone(),
            instance_type: event.instance_type.clone(),
            nft_id: event.nft_id.to_string(),
            terminate_on: event.will_be_end_on,
        }
    }
}

impl From<&RentedEvent> for TerminateDispatch {
    fn from(event: &RentedEvent) -> Self {
        Self { tenant: event.tenant.to_string(), nft_id: event.nft_id.to_string() }
    }
}

impl From<&StoppedEvent> for StopDispatch {
    fn from(event: &StoppedEvent) -> Self {
        Self { tenant: event.tenant.to_string(), nft_id: event.nft_id.to_string() }
    }
}

impl From<&TerminatedEvent> for TerminateDispatch {
    fn from(event: &TerminatedEvent) -> Self {
        Self { tenant: event.tenant.to_string(), nft_id: event.nft_id.to_string() }
    }
}
