use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Select, Sender};
use parking_lot::Mutex;

use super::reader::SocketReader;
use crate::address::Destination;
use crate::config::TransportConfig;
use crate::datagram::{check_adopted, DatagramSocket, IgnorableResult};
use crate::error::{CarrierError, Result};
use crate::transport::{PendingMessage, ReceivedMessage, RecvCallback, Transport, TransportState};

/// What the dispatcher is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Waiting for work on either queue.
    Idle,
    /// Waiting for a reply to what was just sent.
    Reading,
    /// Running the receive callback.
    Delivering,
}

struct Endpoint<S> {
    state: TransportState,
    /// Socket handed in by the owner, consumed on open.
    adopted: Option<S>,
    socket: Option<Arc<S>>,
    local: Option<SocketAddr>,
    reader: Option<SocketReader>,
    /// Moves to the reader on open; the transport never keeps a copy.
    inbox_tx: Option<Sender<ReceivedMessage>>,
}

/// Datagram transport driven by a caller-run dispatch loop.
///
/// A background thread reads the socket into an inbox; `send_message` fills
/// an outbox. [`DgramTransport::dispatch_once`] drains both, one exchange at
/// a time.
pub struct DgramTransport<S: DatagramSocket = UdpSocket> {
    config: TransportConfig,
    endpoint: Mutex<Endpoint<S>>,
    callback: Mutex<Option<RecvCallback>>,
    phase: Mutex<DispatchPhase>,
    outbox_tx: Sender<PendingMessage>,
    outbox_rx: Receiver<PendingMessage>,
    inbox_rx: Receiver<ReceivedMessage>,
    /// Dropped on close, which wakes an idle dispatcher.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl DgramTransport<UdpSocket> {
    pub fn new(config: TransportConfig) -> Self {
        Self::build(None, config)
    }
}

impl<S: DatagramSocket> DgramTransport<S> {
    /// Wraps an already bound socket instead of binding one on open.
    pub fn with_socket(socket: S, config: TransportConfig) -> Self {
        Self::build(Some(socket), config)
    }

    fn build(adopted: Option<S>, config: TransportConfig) -> Self {
        let (outbox_tx, outbox_rx) = unbounded();
        let (inbox_tx, inbox_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        DgramTransport {
            config,
            endpoint: Mutex::new(Endpoint {
                state: TransportState::Unopened,
                adopted,
                socket: None,
                local: None,
                reader: None,
                inbox_tx: Some(inbox_tx),
            }),
            callback: Mutex::new(None),
            phase: Mutex::new(DispatchPhase::Idle),
            outbox_tx,
            outbox_rx,
            inbox_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn phase(&self) -> DispatchPhase {
        *self.phase.lock()
    }

    /// Messages waiting in the outbox.
    pub fn pending_sends(&self) -> usize {
        self.outbox_rx.len()
    }

    /// Received messages waiting in the inbox.
    pub fn pending_deliveries(&self) -> usize {
        self.inbox_rx.len()
    }

    fn target(&self) -> &str {
        &self.config.log_target
    }

    fn open(&self, mode: TransportState, iface: Option<SocketAddr>) -> Result<()> {
        let mut ep = self.endpoint.lock();
        let requested = iface.unwrap_or(self.config.client_bind_addr);
        if ep.state != TransportState::Unopened {
            return Err(CarrierError::Bind {
                addr: requested,
                source: io::Error::new(io::ErrorKind::AddrInUse, "transport was already opened"),
            });
        }

        if let Some(socket) = ep.adopted.as_ref() {
            check_adopted(socket, iface)?;
        }
        let socket = match ep.adopted.take() {
            Some(socket) => socket,
            None => S::bind(requested).map_err(|source| CarrierError::Bind {
                addr: requested,
                source,
            })?,
        };
        let local = socket.local_addr().ok();
        let socket = Arc::new(socket);

        let inbox_tx = ep
            .inbox_tx
            .take()
            .ok_or(CarrierError::NotOpen { operation: "open" })?;
        let reader = match SocketReader::spawn(socket.clone(), inbox_tx, local, &self.config) {
            Ok(reader) => reader,
            Err(source) => {
                ep.state = TransportState::Closed;
                return Err(CarrierError::Receive {
                    operation: "open",
                    source,
                });
            }
        };

        log::debug!(target: self.target(), "open: {:?} on {:?}", mode, local);
        ep.state = mode;
        ep.socket = Some(socket);
        ep.local = local;
        ep.reader = Some(reader);
        Ok(())
    }

    /// Runs one dispatch cycle.
    ///
    /// Blocks until either queue has work. An outgoing message is put on the
    /// wire first, then the inbox is waited on for up to `timeout` at a time:
    /// every expiry calls `tick` with the current time, sends at most one
    /// more queued message and asks `jobs_pending` whether a reply is still
    /// expected. The cycle ends after one delivery, once nothing is pending,
    /// or on an ignorable socket error. With nothing to send, one already
    /// received message is delivered.
    pub fn dispatch_once<T, J>(&self, timeout: Duration, mut tick: T, mut jobs_pending: J) -> Result<()>
    where
        T: FnMut(Instant),
        J: FnMut() -> bool,
    {
        let socket = {
            let ep = self.endpoint.lock();
            match ep.state {
                TransportState::Unopened => {
                    return Err(CarrierError::NotOpen {
                        operation: "dispatch",
                    })
                }
                TransportState::Closed => return Ok(()),
                _ => {}
            }
            ep.socket
                .clone()
                .ok_or(CarrierError::NotOpen { operation: "dispatch" })?
        };

        self.set_phase(DispatchPhase::Idle);
        let mut sel = Select::new();
        sel.recv(&self.outbox_rx);
        sel.recv(&self.inbox_rx);
        sel.recv(&self.shutdown_rx);
        sel.ready();

        if self.state() == TransportState::Closed {
            return Ok(());
        }

        if let Ok(msg) = self.outbox_rx.try_recv() {
            if !self.transmit(&socket, msg)? {
                return Ok(());
            }

            self.set_phase(DispatchPhase::Reading);
            loop {
                match self.inbox_rx.recv_timeout(timeout) {
                    Ok(msg) => return self.deliver(msg),
                    Err(RecvTimeoutError::Timeout) => {
                        tick(Instant::now());
                        log::trace!(target: self.target(), "dispatch: tick timeout");

                        if self.state() == TransportState::Closed {
                            return Ok(());
                        }
                        if let Ok(msg) = self.outbox_rx.try_recv() {
                            if !self.transmit(&socket, msg)? {
                                return Ok(());
                            }
                        }
                        if !jobs_pending() {
                            log::debug!(target: self.target(), "dispatch: no response expected");
                            self.set_phase(DispatchPhase::Idle);
                            return Ok(());
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return self.reader_gone(),
                }
            }
        }

        match self.inbox_rx.try_recv() {
            Ok(msg) => self.deliver(msg),
            Err(e) if e.is_disconnected() => self.reader_gone(),
            Err(_) => Ok(()),
        }
    }

    /// Keeps running cycles while `jobs_pending` holds.
    pub fn dispatch_while<T, J>(&self, timeout: Duration, mut tick: T, mut jobs_pending: J) -> Result<()>
    where
        T: FnMut(Instant),
        J: FnMut() -> bool,
    {
        while jobs_pending() && self.state().is_open() {
            self.dispatch_once(timeout, &mut tick, &mut jobs_pending)?;
        }
        Ok(())
    }

    /// Sends one message. `Ok(false)` means an ignorable socket error ended
    /// the cycle.
    fn transmit(&self, socket: &S, msg: PendingMessage) -> Result<bool> {
        let dst = match msg.destination.remote_addr() {
            Some(dst) => dst,
            None => {
                log::debug!(
                    target: self.target(),
                    "transmit: missing dst address, losing outgoing msg of {} bytes",
                    msg.payload.len()
                );
                return Ok(true);
            }
        };

        log::trace!(
            target: self.target(),
            "transmit: {:?} -> {} outgoing {} bytes {}",
            self.local_addr(),
            dst,
            msg.payload.len(),
            self.config.dump(&msg.payload)
        );
        match socket.send_to(&msg.payload, dst).ignorable() {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                log::debug!(target: self.target(), "transmit: ignoring socket error for {}", dst);
                Ok(false)
            }
            Err(source) => Err(CarrierError::Transmit {
                operation: "dispatch",
                destination: dst,
                source,
            }),
        }
    }

    fn deliver(&self, msg: ReceivedMessage) -> Result<()> {
        if self.state() == TransportState::Closed {
            log::debug!(
                target: self.target(),
                "deliver: transport closed, dropping {} bytes from {}",
                msg.payload.len(),
                msg.source
            );
            self.set_phase(DispatchPhase::Idle);
            return Ok(());
        }

        self.set_phase(DispatchPhase::Delivering);
        let taken = self.callback.lock().take();
        let res = match taken {
            Some(mut callback) => {
                callback(self, msg.source, msg.payload);
                let mut slot = self.callback.lock();
                if slot.is_none() {
                    *slot = Some(callback);
                }
                Ok(())
            }
            None => Err(CarrierError::MissingCallback { peer: msg.source }),
        };
        self.set_phase(DispatchPhase::Idle);
        res
    }

    fn reader_gone(&self) -> Result<()> {
        self.set_phase(DispatchPhase::Idle);
        let ep = self.endpoint.lock();
        if ep.state == TransportState::Closed {
            return Ok(());
        }
        let source = ep
            .reader
            .as_ref()
            .and_then(|reader| reader.take_failure())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "reader thread exited"));
        Err(CarrierError::Receive {
            operation: "dispatch",
            source,
        })
    }

    fn set_phase(&self, phase: DispatchPhase) {
        *self.phase.lock() = phase;
    }
}

impl<S: DatagramSocket> Transport for DgramTransport<S> {
    fn open_client_mode(&self, iface: Option<SocketAddr>) -> Result<()> {
        self.open(TransportState::ClientOpen, iface)
    }

    fn open_server_mode(&self, iface: SocketAddr) -> Result<()> {
        self.open(TransportState::ServerOpen, Some(iface))
    }

    fn send_message(&self, payload: Vec<u8>, destination: Destination) -> Result<()> {
        if self.state() == TransportState::Closed {
            log::debug!(
                target: self.target(),
                "send_message: transport closed, dropping {} bytes for {}",
                payload.len(),
                destination
            );
            return Ok(());
        }

        log::trace!(
            target: self.target(),
            "send_message: queuing {} bytes for {}",
            payload.len(),
            destination
        );
        // the outbox receiver lives as long as self
        let _ = self.outbox_tx.send(PendingMessage {
            payload,
            destination,
        });
        Ok(())
    }

    fn register_callback(&self, callback: RecvCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn close(&self) {
        let reader = {
            let mut ep = self.endpoint.lock();
            if ep.state == TransportState::Closed {
                return;
            }
            ep.state = TransportState::Closed;
            ep.socket = None;
            ep.inbox_tx = None;
            self.shutdown_tx.lock().take();
            ep.reader.take()
        };
        if let Some(mut reader) = reader {
            reader.stop();
        }

        let lost_out = self.outbox_rx.try_iter().count();
        let lost_in = self.inbox_rx.try_iter().count();
        if lost_out + lost_in > 0 {
            log::debug!(
                target: self.target(),
                "close: dropped {} outgoing and {} incoming messages",
                lost_out,
                lost_in
            );
        }
        log::debug!(target: self.target(), "close: done");
    }

    fn state(&self) -> TransportState {
        self.endpoint.lock().state
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.lock().local
    }
}

impl<S: DatagramSocket> Drop for DgramTransport<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressPair;

    #[test]
    fn nothing_is_delivered_after_close() {
        let transport = DgramTransport::new(TransportConfig::default());
        transport
            .open_client_mode(Some("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        transport.register_callback(Box::new(move |_, _, _| *c.lock() += 1));

        let source = AddressPair::new(None, "127.0.0.1:9".parse().unwrap());
        transport.close();
        transport
            .deliver(ReceivedMessage {
                source,
                payload: b"late".to_vec(),
            })
            .unwrap();

        assert_eq!(*calls.lock(), 0);
        assert_eq!(transport.phase(), DispatchPhase::Idle);
    }
}
