//! Callback-driven backend on a single-threaded event loop.

mod event_loop;
mod transport;

pub use event_loop::{Reactor, Task};
pub use transport::{ProtocolState, ReactorTransport};
