//! cdc-fanout - Change-data-capture fan-out
//!
//! Reads the change log of a table, matches every change event against a
//! static set of routes, transforms matches into consumer messages and
//! delivers them through durable queues to batch-invoked consumers, with
//! partial-batch retry and dead-lettering.
//!
//! ```text
//! table -> change log -> FanoutRouter -> DurableQueue -> ConsumerInvoker -> handler
//!                         (filter, transform)   (visibility, redrive)
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod filter;
pub mod ingress;
pub mod invoker;
pub mod message;
pub mod newsletter;
pub mod queue;
pub mod router;
pub mod source;
pub mod transform;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::PipelineError;
pub use event::{ChangeEvent, EventKey, EventType};
pub use message::{Delivery, DeliveryBatch, MessageId, OutboundMessage};
