//! `OpCast` Client -- reconnecting connection core for the `OpCast` protocol.
//!
//! The [`Connection`] multiplexes document and query subscriptions over a
//! single socket:
//!
//! - **State** ([`state`]): five-state lifecycle with restricted transitions
//! - **Socket** ([`socket`]): the adapter contract a transport satisfies
//! - **Observer** ([`observer`]): lifecycle and traffic notifications
//! - **Doc / Query** ([`doc`], [`query`]): the collaborator contracts the
//!   connection routes replies to
//! - **Connection** ([`connection`]): registries, bulk batching, inbound
//!   dispatch, and the quiescence scanner

mod bulk;
pub mod connection;
pub mod doc;
pub mod observer;
pub mod query;
pub mod socket;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{AgentRef, Connection, ConnectionOptions};
pub use doc::{DocFactory, DocHandle, OpData};
pub use observer::{ConnectionObserver, ReceiveEnvelope};
pub use query::{QueryAction, QueryHandle};
pub use socket::{ReadyState, SocketAdapter};
pub use state::{state_for_close_reason, ConnectionState};
