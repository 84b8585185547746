//! Thread-backed backend: a reader thread fills an inbox, and the owner
//! drives delivery and retransmission with [`DgramTransport::dispatch_once`].

mod reader;
mod transport;

pub use transport::{DgramTransport, DispatchPhase};
