//! Host controller interface types and the transport seam.

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::{CommandTransaction, EventHandlerId, EventStream, SharedTransport, Transport};
