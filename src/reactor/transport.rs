use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use super::event_loop::{Core, Reactor, Source};
use crate::address::{AddressPair, Destination};
use crate::config::TransportConfig;
use crate::datagram::{check_adopted, set_nonblock, DatagramSocket, IgnorableResult};
use crate::error::{CarrierError, Result};
use crate::transport::{PendingMessage, RecvCallback, Transport, TransportState};

/// Datagrams read per readiness event before yielding to other sockets.
const MAX_READS_PER_EVENT: usize = 64;

/// Whether the reactor has started the transport yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Sends are queued.
    NotReady,
    /// Sends are written immediately.
    Ready,
    /// Terminal; nothing is sent or delivered any more.
    Stopped,
}

struct Shared<S: DatagramSocket> {
    core: Rc<Core>,
    config: TransportConfig,
    state: Cell<TransportState>,
    protocol: Cell<ProtocolState>,
    adopted: RefCell<Option<S>>,
    socket: RefCell<Option<S>>,
    key: Cell<Option<usize>>,
    local: Cell<Option<SocketAddr>>,
    write_queue: RefCell<VecDeque<PendingMessage>>,
    callback: RefCell<Option<RecvCallback>>,
    buf: RefCell<Vec<u8>>,
}

impl<S: DatagramSocket> Shared<S> {
    fn target(&self) -> &str {
        &self.config.log_target
    }

    fn close(&self) {
        if self.state.get() == TransportState::Closed {
            return;
        }
        self.state.set(TransportState::Closed);
        self.protocol.set(ProtocolState::Stopped);

        let socket = self.socket.borrow_mut().take();
        if let (Some(key), Some(socket)) = (self.key.take(), socket.as_ref()) {
            self.core.deregister(key, socket.as_raw_fd());
        }

        let lost = self.write_queue.borrow_mut().drain(..).count();
        if lost > 0 {
            log::debug!(
                target: self.target(),
                "close: dropped {} queued outgoing messages",
                lost
            );
        }
        log::debug!(target: self.target(), "stop_protocol: invoked");
    }

    fn write(&self, msg: PendingMessage) -> Result<()> {
        let dst = match msg.destination.remote_addr() {
            Some(dst) => dst,
            None => {
                log::debug!(
                    target: self.target(),
                    "write: missing dst address, losing outgoing msg of {} bytes",
                    msg.payload.len()
                );
                return Ok(());
            }
        };

        let socket = self.socket.borrow();
        let socket = match socket.as_ref() {
            Some(socket) => socket,
            None => {
                log::debug!(target: self.target(), "write: no socket, losing outgoing msg for {}", dst);
                return Ok(());
            }
        };

        log::trace!(
            target: self.target(),
            "write: {:?} -> {} outgoing {} bytes {}",
            self.local.get(),
            dst,
            msg.payload.len(),
            self.config.dump(&msg.payload)
        );
        match socket.send_to(&msg.payload, dst).ignorable() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                log::debug!(target: self.target(), "write: ignoring socket error for {}", dst);
                Ok(())
            }
            Err(source) => Err(CarrierError::Transmit {
                operation: "send_message",
                destination: dst,
                source,
            }),
        }
    }
}

impl<S: DatagramSocket> Source for Shared<S> {
    fn on_readable(self: Rc<Self>) -> Result<()> {
        ReactorTransport { shared: self }.read_ready()
    }

    fn on_stop(&self) {
        self.close();
    }
}

impl<S: DatagramSocket> Drop for Shared<S> {
    fn drop(&mut self) {
        // an unclosed transport must not leave its key behind
        if let (Some(key), Some(socket)) = (self.key.take(), self.socket.get_mut().as_ref()) {
            self.core.deregister(key, socket.as_raw_fd());
        }
    }
}

/// Datagram transport driven by a [`Reactor`].
///
/// Sends issued before the reactor has started the transport are queued
/// and flushed oldest-first once it does. Received datagrams are handed to
/// the callback on the reactor tick after they were read, never from inside
/// the read itself.
///
/// Handles are cheap clones of the same transport.
pub struct ReactorTransport<S: DatagramSocket = UdpSocket> {
    shared: Rc<Shared<S>>,
}

impl<S: DatagramSocket> Clone for ReactorTransport<S> {
    fn clone(&self) -> Self {
        ReactorTransport {
            shared: self.shared.clone(),
        }
    }
}

impl ReactorTransport<UdpSocket> {
    pub fn new(reactor: &Reactor, config: TransportConfig) -> Self {
        Self::build(reactor, None, config)
    }
}

impl<S: DatagramSocket> ReactorTransport<S> {
    /// Wraps an already bound socket instead of binding one on open.
    pub fn with_socket(reactor: &Reactor, socket: S, config: TransportConfig) -> Self {
        Self::build(reactor, Some(socket), config)
    }

    fn build(reactor: &Reactor, adopted: Option<S>, config: TransportConfig) -> Self {
        let buf = vec![0u8; config.max_datagram_size];
        ReactorTransport {
            shared: Rc::new(Shared {
                core: reactor.core(),
                config,
                state: Cell::new(TransportState::Unopened),
                protocol: Cell::new(ProtocolState::NotReady),
                adopted: RefCell::new(adopted),
                socket: RefCell::new(None),
                key: Cell::new(None),
                local: Cell::new(None),
                write_queue: RefCell::new(VecDeque::new()),
                callback: RefCell::new(None),
                buf: RefCell::new(buf),
            }),
        }
    }

    pub fn protocol_state(&self) -> ProtocolState {
        self.shared.protocol.get()
    }

    /// Sends waiting for the transport to start.
    pub fn pending_writes(&self) -> usize {
        self.shared.write_queue.borrow().len()
    }

    fn open(&self, mode: TransportState, iface: Option<SocketAddr>) -> Result<()> {
        let shared = &self.shared;
        let requested = iface.unwrap_or(shared.config.client_bind_addr);
        if shared.state.get() != TransportState::Unopened {
            return Err(CarrierError::Bind {
                addr: requested,
                source: io::Error::new(io::ErrorKind::AddrInUse, "transport was already opened"),
            });
        }

        if let Some(socket) = shared.adopted.borrow().as_ref() {
            check_adopted(socket, iface)?;
        }
        let adopted = shared.adopted.borrow_mut().take();
        let socket = match adopted {
            Some(socket) => socket,
            None => S::bind(requested).map_err(|source| CarrierError::Bind {
                addr: requested,
                source,
            })?,
        };
        set_nonblock(socket.as_raw_fd()).map_err(|source| CarrierError::Bind {
            addr: requested,
            source,
        })?;

        let me: Weak<dyn Source> = Rc::downgrade(&self.shared) as Weak<dyn Source>;
        let key = shared
            .core
            .register(socket.as_raw_fd(), me)
            .map_err(|source| CarrierError::Poll {
                operation: "open",
                source,
            })?;

        let local = socket.local_addr().ok();
        log::debug!(target: shared.target(), "open: {:?} on {:?}", mode, local);
        shared.local.set(local);
        shared.key.set(Some(key));
        *shared.socket.borrow_mut() = Some(socket);
        shared.state.set(mode);

        let handle = self.clone();
        shared.core.call_soon(Box::new(move || handle.start()));
        Ok(())
    }

    /// The reactor's start signal: flush queued sends, then go Ready.
    ///
    /// A fatal write error is returned from the tick and the signal is
    /// posted again, so the rest of the queue and later sends still go out
    /// in order on the next tick.
    fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.protocol.get() != ProtocolState::NotReady {
            return Ok(());
        }
        log::debug!(
            target: shared.target(),
            "start_protocol: flushing {} queued messages",
            shared.write_queue.borrow().len()
        );
        loop {
            let next = shared.write_queue.borrow_mut().pop_front();
            let msg = match next {
                Some(msg) => msg,
                None => break,
            };
            if let Err(e) = shared.write(msg) {
                let handle = self.clone();
                shared.core.call_soon(Box::new(move || handle.start()));
                return Err(e);
            }
        }
        shared.protocol.set(ProtocolState::Ready);
        Ok(())
    }

    fn read_ready(&self) -> Result<()> {
        let shared = &self.shared;
        for _ in 0..MAX_READS_PER_EVENT {
            let res = {
                let socket = shared.socket.borrow();
                let socket = match socket.as_ref() {
                    Some(socket) => socket,
                    None => return Ok(()),
                };
                let mut buf = shared.buf.borrow_mut();
                socket
                    .recv_from(&mut buf)
                    .map(|(n, from)| (buf[..n].to_vec(), from))
            };

            match res {
                Ok((payload, from)) => self.datagram_received(payload, from)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if let Err(source) = Err::<(), _>(e).ignorable() {
                        return Err(CarrierError::Receive {
                            operation: "datagram_received",
                            source,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn datagram_received(&self, payload: Vec<u8>, from: SocketAddr) -> Result<()> {
        let shared = &self.shared;
        // the local endpoint is not known at this layer
        let peer = AddressPair::new(None, from);
        if shared.callback.borrow().is_none() {
            return Err(CarrierError::MissingCallback { peer });
        }

        log::trace!(
            target: shared.target(),
            "datagram_received: {} incoming {} bytes {}",
            from,
            payload.len(),
            shared.config.dump(&payload)
        );
        let handle = self.clone();
        shared
            .core
            .call_soon(Box::new(move || handle.deliver(peer, payload)));
        Ok(())
    }

    fn deliver(&self, peer: AddressPair, payload: Vec<u8>) -> Result<()> {
        let shared = &self.shared;
        if shared.protocol.get() == ProtocolState::Stopped {
            log::debug!(
                target: shared.target(),
                "deliver: stopped, dropping {} bytes from {}",
                payload.len(),
                peer.remote_addr()
            );
            return Ok(());
        }

        let taken = shared.callback.borrow_mut().take();
        let mut callback = taken.ok_or(CarrierError::MissingCallback { peer })?;
        callback(self, peer, payload);
        let mut slot = shared.callback.borrow_mut();
        if slot.is_none() {
            *slot = Some(callback);
        }
        Ok(())
    }
}

impl<S: DatagramSocket> Transport for ReactorTransport<S> {
    fn open_client_mode(&self, iface: Option<SocketAddr>) -> Result<()> {
        self.open(TransportState::ClientOpen, iface)
    }

    fn open_server_mode(&self, iface: SocketAddr) -> Result<()> {
        self.open(TransportState::ServerOpen, Some(iface))
    }

    fn send_message(&self, payload: Vec<u8>, destination: Destination) -> Result<()> {
        let shared = &self.shared;
        let msg = PendingMessage {
            payload,
            destination,
        };
        match shared.protocol.get() {
            ProtocolState::Ready => shared.write(msg),
            ProtocolState::NotReady => {
                log::trace!(
                    target: shared.target(),
                    "send_message: queuing {} bytes for {}",
                    msg.payload.len(),
                    msg.destination
                );
                shared.write_queue.borrow_mut().push_back(msg);
                Ok(())
            }
            ProtocolState::Stopped => {
                log::debug!(
                    target: shared.target(),
                    "send_message: stopped, dropping {} bytes for {}",
                    msg.payload.len(),
                    msg.destination
                );
                Ok(())
            }
        }
    }

    fn register_callback(&self, callback: RecvCallback) {
        *self.shared.callback.borrow_mut() = Some(callback);
    }

    fn close(&self) {
        self.shared.close();
    }

    fn state(&self) -> TransportState {
        self.shared.state.get()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local.get()
    }
}
