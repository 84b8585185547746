use std::fmt::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::datagram::MAX_DATAGRAM_SIZE;

/// Per-transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size; longer datagrams are truncated.
    pub max_datagram_size: usize,
    /// How often an idle background reader re-checks for shutdown.
    pub reader_poll_interval: Duration,
    /// Local address used by `open_client_mode(None)`.
    pub client_bind_addr: SocketAddr,
    /// Log target every record of the transport is emitted under.
    pub log_target: String,
    /// Include payload hexdumps in I/O trace records.
    pub trace_payloads: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            reader_poll_interval: Duration::from_millis(100),
            client_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            log_target: "dgram_carrier".into(),
            trace_payloads: false,
        }
    }
}

impl TransportConfig {
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size.clamp(1, MAX_DATAGRAM_SIZE);
        self
    }

    pub fn with_reader_poll_interval(mut self, interval: Duration) -> Self {
        self.reader_poll_interval = interval;
        self
    }

    pub fn with_client_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.client_bind_addr = addr;
        self
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    pub fn with_trace_payloads(mut self, enabled: bool) -> Self {
        self.trace_payloads = enabled;
        self
    }

    /// Payload rendering for trace records, empty unless `trace_payloads`.
    pub(crate) fn dump(&self, payload: &[u8]) -> String {
        if self.trace_payloads {
            hexdump(payload)
        } else {
            String::new()
        }
    }
}

/// Renders bytes as space separated hex, sixteen to a line.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:05x}:", i * 16);
        for b in chunk {
            let _ = write!(out, " {:02x}", b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_full_datagram() {
        let config = TransportConfig::default();
        assert_eq!(config.max_datagram_size, 65535);
        assert_eq!(config.client_bind_addr.port(), 0);
        assert!(!config.trace_payloads);
    }

    #[test]
    fn datagram_size_is_clamped() {
        let config = TransportConfig::default().with_max_datagram_size(1 << 20);
        assert_eq!(config.max_datagram_size, MAX_DATAGRAM_SIZE);
        let config = config.with_max_datagram_size(0);
        assert_eq!(config.max_datagram_size, 1);
    }

    #[test]
    fn hexdump_wraps_lines() {
        let bytes: Vec<u8> = (0u8..18).collect();
        assert_eq!(
            hexdump(&bytes),
            "00000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n00010: 10 11"
        );
        assert_eq!(hexdump(&[]), "");
    }

    #[test]
    fn dump_is_silent_unless_enabled() {
        let config = TransportConfig::default();
        assert_eq!(config.dump(b"PING"), "");
        let config = config.with_trace_payloads(true);
        assert_eq!(config.dump(b"PING"), "00000: 50 49 4e 47");
    }
}
