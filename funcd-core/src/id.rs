//! Time-ordered id generation for calls and catalog resources.
//!
//! An id is 16 bytes, hex-encoded: a 6-byte big-endian millisecond
//! timestamp, the 6-byte machine id, and a 4-byte per-process counter.
//! The timestamp prefix makes ids sort by creation time, which the call
//! listing endpoints rely on.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static MACHINE_ID: OnceLock<[u8; 6]> = OnceLock::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Bind the process-wide machine id to the given advertised address.
///
/// Called once at startup, before any listener is up; later calls are
/// no-ops. The machine id is read-only thereafter.
pub fn init_machine_id(addr: SocketAddr) {
    let _ = MACHINE_ID.set(encode_machine(addr));
}

/// The machine id in effect; defaults to a loopback-derived value when
/// [`init_machine_id`] was never called (tests, tooling).
pub fn machine_id() -> [u8; 6] {
    *MACHINE_ID.get_or_init(|| encode_machine(SocketAddr::from(([127, 0, 0, 1], 0))))
}

/// Discover the first non-loopback IPv4 address of this host.
///
/// Uses a connected (never written) UDP socket to ask the OS for the
/// outbound interface; falls back to loopback when the host is offline.
pub fn discover_local_addr(port: u16) -> SocketAddr {
    let ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    SocketAddr::new(ip, port)
}

fn encode_machine(addr: SocketAddr) -> [u8; 6] {
    let mut out = [0u8; 6];
    match addr.ip() {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out[..4].copy_from_slice(&v6.octets()[12..16]),
    }
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Generate a new time-ordered id.
pub fn new_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut raw = [0u8; 16];
    raw[..6].copy_from_slice(&millis.to_be_bytes()[2..]);
    raw[6..12].copy_from_slice(&machine_id());
    raw[12..].copy_from_slice(&count.to_be_bytes());
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_sorted() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        // Same-millisecond ids still order by counter.
        assert!(a < b);
    }

    #[test]
    fn machine_id_is_stable() {
        assert_eq!(machine_id(), machine_id());
    }
}
