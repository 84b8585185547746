use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::address::AddressPair;
use crate::config::TransportConfig;
use crate::datagram::{DatagramSocket, IgnorableResult};
use crate::poller::{Event, Poller};
use crate::transport::ReceivedMessage;

const POLL_KEY_SOCKET: usize = 100;

/// Background thread feeding received datagrams into the inbox.
///
/// The thread exits when stopped, when the inbox receiver goes away, or on
/// the first fatal socket error, which is kept for the dispatcher to report.
/// Exiting drops the inbox sender, so a dispatcher waiting on the inbox
/// notices.
pub(crate) struct SocketReader {
    running: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<io::Error>>>,
    handle: Option<JoinHandle<()>>,
}

impl SocketReader {
    pub fn spawn<S: DatagramSocket>(
        socket: Arc<S>,
        inbox: Sender<ReceivedMessage>,
        local: Option<SocketAddr>,
        config: &TransportConfig,
    ) -> io::Result<Self> {
        let poller = Poller::new()?;
        poller.add(socket.as_raw_fd(), POLL_KEY_SOCKET)?;

        let running = Arc::new(AtomicBool::new(true));
        let failure = Arc::new(Mutex::new(None));
        let mut reader = ReaderLoop {
            socket,
            inbox,
            poller,
            local,
            running: running.clone(),
            failure: failure.clone(),
            buf: vec![0u8; config.max_datagram_size],
            config: config.clone(),
        };

        let handle = thread::Builder::new()
            .name("dgram-reader".into())
            .spawn(move || reader.run())?;

        Ok(SocketReader {
            running,
            failure,
            handle: Some(handle),
        })
    }

    /// Fatal error the thread died with, if any.
    pub fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("reader thread panicked");
            }
        }
    }
}

impl Drop for SocketReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReaderLoop<S> {
    socket: Arc<S>,
    inbox: Sender<ReceivedMessage>,
    poller: Poller,
    local: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<io::Error>>>,
    buf: Vec<u8>,
    config: TransportConfig,
}

impl<S: DatagramSocket> ReaderLoop<S> {
    fn run(&mut self) {
        let target = self.config.log_target.clone();
        log::debug!(target: &target, "reader: started on {:?}", self.local);

        let mut events: Vec<Event> = Vec::new();
        while self.running.load(Ordering::Acquire) {
            events.clear();
            if let Err(e) = self
                .poller
                .wait(&mut events, Some(self.config.reader_poll_interval))
            {
                log::error!(target: &target, "reader: wait failed on {:?}: {}", self.local, e);
                *self.failure.lock() = Some(e);
                break;
            }
            if events.is_empty() || !self.running.load(Ordering::Acquire) {
                continue;
            }

            match self.socket.recv_from(&mut self.buf).ignorable() {
                Ok(Some((n, from))) => {
                    log::trace!(
                        target: &target,
                        "reader: {} -> {:?} incoming {} bytes {}",
                        from,
                        self.local,
                        n,
                        self.config.dump(&self.buf[..n])
                    );
                    let msg = ReceivedMessage {
                        source: AddressPair::new(self.local, from),
                        payload: self.buf[..n].to_vec(),
                    };
                    if self.inbox.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!(target: &target, "reader: recvfrom failed on {:?}: {}", self.local, e);
                    *self.failure.lock() = Some(e);
                    break;
                }
            }
        }

        log::debug!(target: &target, "reader: stopped on {:?}", self.local);
    }
}
