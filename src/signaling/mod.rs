//! Signaling: wire catalog and the WebSocket transport
//!
//! The transport is owned by the client, opened and closed explicitly, and
//! hands every decoded server message to a single event stream.

mod messages;
mod transport;

pub use messages::*;
pub use transport::{
    SignalingError, SignalingHandle, SignalingSink, SignalingTransport, TransportEvent,
};
