mod traits;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::{classify, CarrierError, SocketErrorClass};

pub use traits::DatagramSocket;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

pub(crate) fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    match unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Checks a socket bound by the owner before it is taken over. A requested
/// interface must match the address the socket is already bound to.
pub(crate) fn check_adopted<S: DatagramSocket>(
    socket: &S,
    iface: Option<SocketAddr>,
) -> Result<(), CarrierError> {
    let iface = match iface {
        Some(iface) => iface,
        None => return Ok(()),
    };
    match socket.local_addr() {
        Ok(local) if local == iface => Ok(()),
        Ok(local) => Err(CarrierError::Bind {
            addr: iface,
            source: io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("socket is already bound to {}", local),
            ),
        }),
        Err(source) => Err(CarrierError::Bind { addr: iface, source }),
    }
}

/// Folds transient socket conditions into `Ok(None)`.
pub trait IgnorableResult<T> {
    fn ignorable(self) -> io::Result<Option<T>>;
}

impl<T> IgnorableResult<T> for io::Result<T> {
    fn ignorable(self) -> io::Result<Option<T>> {
        match self {
            Ok(x) => Ok(Some(x)),
            Err(e) => match classify(&e) {
                SocketErrorClass::Ignorable => {
                    log::trace!("ignoring socket error: {}", e);
                    Ok(None)
                }
                SocketErrorClass::Fatal => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn ignorable_swallows_transient_errors_only() {
        let would_block: io::Result<usize> = Err(io::Error::from_raw_os_error(libc::EAGAIN));
        assert!(would_block.ignorable().unwrap().is_none());

        let refused: io::Result<usize> = Err(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert!(refused.ignorable().unwrap().is_none());

        let denied: io::Result<usize> = Err(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(denied.ignorable().unwrap_err().raw_os_error(), Some(libc::EACCES));

        assert_eq!(Ok::<_, io::Error>(3).ignorable().unwrap(), Some(3));
    }

    #[test]
    fn adopted_socket_must_sit_on_the_requested_interface() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let bound = socket.local_addr().unwrap();
        assert!(check_adopted(&socket, None).is_ok());
        assert!(check_adopted(&socket, Some(bound)).is_ok());

        let other: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match check_adopted(&socket, Some(other)) {
            Err(CarrierError::Bind { addr, source }) => {
                assert_eq!(addr, other);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            res => panic!("expected a bind error, got {:?}", res),
        }
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        set_nonblock(socket.as_raw_fd()).unwrap();

        let mut buf = [0u8; 16];
        let err = DatagramSocket::recv_from(&socket, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
