//! Shared helpers for the transport integration tests.
#![allow(dead_code)]

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dgram_carrier::{AddressPair, DatagramSocket, RecvCallback};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A loopback address nothing listens on.
pub fn dead_addr() -> SocketAddr {
    let socket = UdpSocket::bind(loopback()).unwrap();
    socket.local_addr().unwrap()
}

pub type Received = Arc<Mutex<Vec<(AddressPair, Vec<u8>)>>>;

/// Callback that records every delivery.
pub fn recorder() -> (Received, RecvCallback) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callback: RecvCallback = Box::new(move |_, from, payload| {
        sink.lock().unwrap().push((from, payload));
    });
    (received, callback)
}

/// Plain UDP peer living on its own thread.
pub struct Peer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Peer {
    /// Answers every datagram with the same payload.
    pub fn echo() -> Peer {
        Peer::spawn(true)
    }

    /// Records datagrams without answering.
    pub fn silent() -> Peer {
        Peer::spawn(false)
    }

    fn spawn(echo: bool) -> Peer {
        let socket = UdpSocket::bind(loopback()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let r = running.clone();
        let s = seen.clone();
        let handle = thread::spawn(move || {
            let mut buf = vec![0u8; 65535];
            while r.load(Ordering::Acquire) {
                if let Ok((n, from)) = socket.recv_from(&mut buf) {
                    s.lock().unwrap().push(buf[..n].to_vec());
                    if echo {
                        let _ = socket.send_to(&buf[..n], from);
                    }
                }
            }
        });

        Peer {
            addr,
            running,
            seen,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits until `count` datagrams arrived or `wait` passed.
    pub fn seen(&self, count: usize, wait: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + wait;
        while self.seen.lock().unwrap().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sends one datagram from a throwaway socket, returning its address.
pub fn send_from_peer(payload: &[u8], to: SocketAddr) -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind(loopback()).unwrap();
    socket.send_to(payload, to).unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// UDP socket whose sends fail with an injected OS error while one is set.
pub struct FaultySocket {
    inner: UdpSocket,
    fault: Arc<Mutex<Option<i32>>>,
}

impl FaultySocket {
    pub fn bind_loopback() -> (FaultySocket, Arc<Mutex<Option<i32>>>) {
        let fault = Arc::new(Mutex::new(None));
        let socket = FaultySocket {
            inner: UdpSocket::bind(loopback()).unwrap(),
            fault: fault.clone(),
        };
        (socket, fault)
    }
}

impl AsRawFd for FaultySocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl DatagramSocket for FaultySocket {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(FaultySocket {
            inner: UdpSocket::bind(addr)?,
            fault: Arc::new(Mutex::new(None)),
        })
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if let Some(code) = *self.fault.lock().unwrap() {
            return Err(io::Error::from_raw_os_error(code));
        }
        self.inner.send_to(buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
