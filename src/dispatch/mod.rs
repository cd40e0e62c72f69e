//! Typed publish/consume façades over the shared exchange.
//!
//! One concrete [`DispatchQueue`] type covers all three queues, parameterized
//! by payload schema and a [`QueueSpec`] (queue name, routing key, delay
//! capability). [`EventRouter`] maps normalized chain events onto the queues
//! and is the watcher's publish seam.

mod message;
mod queue;
mod router;

pub use message::{RentalDispatch, StopDispatch, TerminateDispatch};
pub use queue::{DispatchQueue, HandlerError, QueueSpec};
pub use router::{EventRouter, EventSink};
