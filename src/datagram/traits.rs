use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;

/// Connectionless socket the transports read from and write to.
///
/// The cooperative backend shares one socket between its reader thread and
/// the dispatching thread, hence the `Sync` bound.
pub trait DatagramSocket: AsRawFd + Send + Sync + Sized + 'static {
    /// Creates a socket bound to `addr`.
    fn bind(addr: SocketAddr) -> io::Result<Self>;

    /// send one single datagram to `target`.
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// receive one single datagram.
    /// a datagram longer than `buf` is truncated.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        UdpSocket::bind(addr)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
