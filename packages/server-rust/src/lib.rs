//! `OpCast` Server -- publish/subscribe fan-out for document mutations.
//!
//! - **`PubSub`** ([`pubsub`]): refcounted channel subscription and
//!   per-subscriber stream fan-out
//! - **Streams** ([`stream`]): the per-subscriber delivery queue
//! - **Transport** ([`transport`]): the contract a channel backend satisfies
//! - **Memory** ([`memory`]): process-local loopback transport

pub mod memory;
pub mod pubsub;
pub mod stream;
pub mod transport;

pub use memory::MemoryTransport;
pub use pubsub::{PubSub, PubSubOptions};
pub use stream::{OpSubscription, StreamOp};
pub use transport::PubSubTransport;
