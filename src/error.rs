use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::address::AddressPair;

pub type Result<T> = std::result::Result<T, CarrierError>;

/// Fatal transport failures.
///
/// Transient socket conditions never show up here; see [`classify`].
#[derive(Error, Debug)]
pub enum CarrierError {
    #[error("bind() for {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{operation}: sendto failed for {destination}: {source}")]
    Transmit {
        operation: &'static str,
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{operation}: recvfrom failed: {source}")]
    Receive {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no receive callback registered, datagram from {peer} has no sink")]
    MissingCallback { peer: AddressPair },

    #[error("{operation}: transport is not open")]
    NotOpen { operation: &'static str },

    #[error("{operation}: readiness wait failed: {source}")]
    Poll {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorClass {
    /// Transient; the operation is treated as a no-op.
    Ignorable,
    Fatal,
}

/// OS error codes that never abort a transport operation.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const IGNORABLE_ERRNOS: &[i32] = &[
    libc::ESHUTDOWN,
    libc::ENOTCONN,
    libc::ECONNRESET,
    libc::ECONNREFUSED,
    libc::EAGAIN,
    libc::EWOULDBLOCK,
    // a descriptor closed under a pending readiness event
    libc::EBADFD,
];

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const IGNORABLE_ERRNOS: &[i32] = &[
    libc::ESHUTDOWN,
    libc::ENOTCONN,
    libc::ECONNRESET,
    libc::ECONNREFUSED,
    libc::EAGAIN,
    libc::EWOULDBLOCK,
];

pub fn classify(err: &io::Error) -> SocketErrorClass {
    let ignorable = match err.raw_os_error() {
        Some(code) => IGNORABLE_ERRNOS.contains(&code),
        None => matches!(
            err.kind(),
            io::ErrorKind::WouldBlock
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::NotConnected
        ),
    };
    if ignorable {
        SocketErrorClass::Ignorable
    } else {
        SocketErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_ignorable() {
        for &code in IGNORABLE_ERRNOS {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(classify(&err), SocketErrorClass::Ignorable, "{}", err);
        }
    }

    #[test]
    fn everything_else_is_fatal() {
        for &code in &[libc::EACCES, libc::ENETUNREACH, libc::EMSGSIZE, libc::EBADF, libc::EINVAL] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(classify(&err), SocketErrorClass::Fatal, "{}", err);
        }
    }

    #[test]
    fn synthetic_errors_classify_by_kind() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        assert_eq!(classify(&reset), SocketErrorClass::Ignorable);

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(classify(&other), SocketErrorClass::Fatal);
    }

    #[test]
    fn transmit_error_names_destination() {
        let err = CarrierError::Transmit {
            operation: "dispatch",
            destination: "127.0.0.1:161".parse().unwrap(),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        let text = err.to_string();
        assert!(text.starts_with("dispatch: sendto failed for 127.0.0.1:161"), "{}", text);
    }
}
