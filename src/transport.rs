//! The contract both backends implement.
//!
//! A protocol engine opens a transport, registers one receive callback and
//! sends opaque payloads. Which backend moves the bytes is decided when the
//! transport is constructed; nothing on this trait leaks it.

use std::net::SocketAddr;

use crate::address::{AddressPair, Destination};
use crate::error::Result;

/// Receives every datagram: the transport it arrived on, where it came from
/// and the payload, which the callback now owns.
pub type RecvCallback = Box<dyn FnMut(&dyn Transport, AddressPair, Vec<u8>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unopened,
    ClientOpen,
    ServerOpen,
    Closed,
}

impl TransportState {
    pub fn is_open(self) -> bool {
        matches!(self, TransportState::ClientOpen | TransportState::ServerOpen)
    }
}

pub trait Transport {
    /// Binds to `iface` if given, otherwise to the configured client address,
    /// and starts receiving.
    fn open_client_mode(&self, iface: Option<SocketAddr>) -> Result<()>;

    /// Binds to `iface` and starts receiving.
    fn open_server_mode(&self, iface: SocketAddr) -> Result<()>;

    /// Hands `payload` over for transmission without blocking.
    ///
    /// A message without a destination is dropped.
    fn send_message(&self, payload: Vec<u8>, destination: Destination) -> Result<()>;

    /// Sets the single receive callback, replacing any previous one.
    fn register_callback(&self, callback: RecvCallback);

    /// Stops receiving and drops whatever is still queued. Idempotent.
    fn close(&self);

    fn state(&self) -> TransportState;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// An outgoing payload waiting for the wire.
#[derive(Debug)]
pub(crate) struct PendingMessage {
    pub payload: Vec<u8>,
    pub destination: Destination,
}

/// An incoming datagram waiting for the callback.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub source: AddressPair,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_states_are_open() {
        assert!(!TransportState::Unopened.is_open());
        assert!(TransportState::ClientOpen.is_open());
        assert!(TransportState::ServerOpen.is_open());
        assert!(!TransportState::Closed.is_open());
    }
}
