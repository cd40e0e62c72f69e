//! Relays OrbitSphere compute-rental contract events into RabbitMQ work
//! queues.
//!
//! The relay watches the OrbitSphere contract for `InstanceRented`,
//! `InstanceStopped` and `InstanceTerminated` events and forwards each one,
//! exactly once, onto a durable queue consumed by provisioning workers. A
//! rental additionally schedules its own termination: the terminate message is
//! published with a broker-side delay that elapses at the rental's expiry
//! instant, so no separate scheduler process exists.
//!
//! # Delivery guarantees
//!
//! * The [`watcher::Watcher`] never silently misses an event: a live
//!   subscription covers the steady state, and catch-up scans close the gap
//!   between the durable [`checkpoint::Checkpoint`] and the chain head after
//!   restarts or dropped subscriptions.
//! * Duplicates from the live/catch-up handover are suppressed by identity
//!   (`(kind, nftId, blockNumber)`) before publish.
//! * Per instance (`nftId`), dispatch order follows chain order. No ordering
//!   is guaranteed across instances.
//! * Queue consumers see at-least-once delivery and must be idempotent: a
//!   message is only acknowledged once its handler succeeds.
//!
//! # Topology
//!
//! One durable delayed-direct exchange, three durable queues (rental, stop,
//! terminate), one routing key per queue. The broker must run the
//! delayed-message exchange plugin; the relay refuses to start without it.

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod watcher;

pub use broker::Broker;
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use dispatch::{DispatchQueue, EventRouter, EventSink};
pub use error::RelayError;
pub use events::{ChainEvent, EventId, EventKind};
pub use watcher::{ChainReader, RpcChain, Watcher, WatcherHandle};
