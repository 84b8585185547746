//! Pluggable datagram carrier for request/response protocol engines.
//!
//! A [`Transport`] moves opaque payloads between a protocol engine and a
//! UDP socket. Two backends implement it:
//!
//! - [`DgramTransport`]: a reader thread feeds an inbox, and the engine
//!   drives sends, deliveries and its retransmission ticks through
//!   [`DgramTransport::dispatch_once`].
//! - [`ReactorTransport`]: registered with a single-threaded [`Reactor`];
//!   sends go out as soon as the reactor has started the transport and
//!   deliveries are deferred to the next reactor tick.

pub mod address;
pub mod config;
pub mod cooperative;
pub mod datagram;
pub mod error;
pub mod poller;
pub mod reactor;
pub mod transport;

pub use address::{AddressPair, Destination};
pub use config::{hexdump, TransportConfig};
pub use cooperative::{DgramTransport, DispatchPhase};
pub use datagram::DatagramSocket;
pub use error::{classify, CarrierError, Result, SocketErrorClass};
pub use reactor::{ProtocolState, Reactor, ReactorTransport};
pub use transport::{RecvCallback, Transport, TransportState};
