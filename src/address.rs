use std::fmt;
use std::net::SocketAddr;

/// The (local, remote) endpoints a datagram travelled between.
///
/// `local` is `None` when the backend cannot tell which interface the
/// datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    local: Option<SocketAddr>,
    remote: SocketAddr,
}

impl AddressPair {
    pub fn new(local: Option<SocketAddr>, remote: SocketAddr) -> Self {
        AddressPair { local, remote }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "{} -> {}", self.remote, local),
            None => write!(f, "{} -> <unknown>", self.remote),
        }
    }
}

/// Where an outgoing message should go.
///
/// Replies are usually addressed with the [`AddressPair`] the request came
/// in with; only its remote half is used for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Addr(SocketAddr),
    Pair(AddressPair),
    /// No destination. Messages sent here are dropped.
    Unset,
}

impl Destination {
    /// The concrete address to hand to `sendto`.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Destination::Addr(addr) => Some(*addr),
            Destination::Pair(pair) => Some(pair.remote_addr()),
            Destination::Unset => None,
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::Addr(addr)
    }
}

impl From<AddressPair> for Destination {
    fn from(pair: AddressPair) -> Self {
        Destination::Pair(pair)
    }
}

impl From<Option<SocketAddr>> for Destination {
    fn from(addr: Option<SocketAddr>) -> Self {
        addr.map_or(Destination::Unset, Destination::Addr)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("<unset>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn pair_resolves_to_remote_half() {
        let pair = AddressPair::new(Some(addr("10.0.0.1:161")), addr("10.0.0.2:40000"));
        let dst = Destination::from(pair);
        assert_eq!(dst.remote_addr(), Some(addr("10.0.0.2:40000")));
        assert_eq!(pair.local_addr(), Some(addr("10.0.0.1:161")));
    }

    #[test]
    fn missing_destination_has_no_address() {
        assert_eq!(Destination::from(None).remote_addr(), None);
        assert_eq!(Destination::Unset.to_string(), "<unset>");
        assert_eq!(
            Destination::from(addr("127.0.0.1:9999")).to_string(),
            "127.0.0.1:9999"
        );
    }

    #[test]
    fn pair_display_marks_unknown_local() {
        let pair = AddressPair::new(None, addr("192.168.1.5:161"));
        assert_eq!(pair.to_string(), "192.168.1.5:161 -> <unknown>");
    }
}
