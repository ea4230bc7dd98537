//! Local connection admission policy
//!
//! Every socket accepted on the tunnel's loopback listener is checked
//! once, before any bytes are relayed. Rejection closes the local socket
//! and touches nothing on the transport. Evaluation happens on the
//! accept path, so implementations must be quick and non-blocking.

use std::net::SocketAddr;
use tracing::{debug, warn};

/// What the policy gets to look at: addressing for one accepted socket.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    /// Remote end of the accepted socket (the connecting client).
    pub peer_addr: SocketAddr,
    /// Listener end of the accepted socket.
    pub local_addr: SocketAddr,
}

/// Decides whether an accepted local connection may use the tunnel.
pub trait RelayPolicy: Send + Sync {
    fn is_connection_allowed(&self, connection: &ConnectionDescriptor) -> bool;
}

/// Admits any loopback peer. The listener only binds loopback, so this
/// is the permissive default for external clients like RDP or SSH.
#[derive(Debug, Default)]
pub struct AllowAllRelayPolicy;

impl RelayPolicy for AllowAllRelayPolicy {
    fn is_connection_allowed(&self, connection: &ConnectionDescriptor) -> bool {
        connection.peer_addr.ip().is_loopback()
    }
}

/// Admits only sockets owned by the current OS process.
///
/// On Linux the peer socket is matched against this process's socket
/// inodes via procfs. Elsewhere there is no portable equivalent, so the
/// policy degrades to loopback-only and logs a warning once.
#[derive(Debug, Default)]
pub struct SameProcessRelayPolicy;

impl RelayPolicy for SameProcessRelayPolicy {
    fn is_connection_allowed(&self, connection: &ConnectionDescriptor) -> bool {
        if !connection.peer_addr.ip().is_loopback() {
            return false;
        }

        #[cfg(target_os = "linux")]
        return match peer_belongs_to_this_process(&connection.peer_addr) {
            Ok(allowed) => {
                if !allowed {
                    debug!(
                        "Rejecting connection from {}: not owned by this process",
                        connection.peer_addr
                    );
                }
                allowed
            }
            Err(e) => {
                warn!("Same-process check failed ({}), rejecting connection", e);
                false
            }
        };

        #[cfg(not(target_os = "linux"))]
        {
            warn_fallback_once();
            true
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn warn_fallback_once() {
    static WARNED: std::sync::Once = std::sync::Once::new();
    WARNED.call_once(|| {
        warn!("Same-process policy has no socket-owner check on this platform; allowing all loopback peers");
    });
}

/// Look up the socket whose local address is `peer` in the kernel TCP
/// tables and check that its inode belongs to this process.
#[cfg(target_os = "linux")]
fn peer_belongs_to_this_process(peer: &SocketAddr) -> std::io::Result<bool> {
    let own_inodes = linux::own_socket_inodes()?;

    let table = match peer {
        SocketAddr::V4(_) => std::fs::read_to_string("/proc/net/tcp")?,
        SocketAddr::V6(_) => std::fs::read_to_string("/proc/net/tcp6")?,
    };

    match linux::find_socket_inode(&table, peer) {
        Some(inode) => Ok(own_inodes.contains(&inode)),
        None => Ok(false),
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    /// Socket inodes of all fds held by this process, from the
    /// `socket:[inode]` link targets under `/proc/self/fd`.
    pub(super) fn own_socket_inodes() -> std::io::Result<HashSet<u64>> {
        let mut inodes = HashSet::new();
        for entry in std::fs::read_dir("/proc/self/fd")? {
            let entry = entry?;
            let Ok(link) = std::fs::read_link(entry.path()) else {
                continue;
            };
            let link = link.to_string_lossy();
            if let Some(inode) = link
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }

    /// Scan a `/proc/net/tcp{,6}` table for the row whose local address
    /// equals `addr` and return its inode column.
    pub(super) fn find_socket_inode(table: &str, addr: &SocketAddr) -> Option<u64> {
        let wanted = encode_addr(addr);
        for line in table.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let _slot = fields.next()?;
            let local = fields.next()?;
            if !local.eq_ignore_ascii_case(&wanted) {
                continue;
            }
            // rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
            let inode = fields.nth(7)?;
            return inode.parse().ok();
        }
        None
    }

    /// Kernel table format: hex address (IPv4 little-endian per octet
    /// group) `:` hex port.
    fn encode_addr(addr: &SocketAddr) -> String {
        match addr.ip() {
            IpAddr::V4(ip) => format!("{}:{:04X}", encode_ipv4(ip), addr.port()),
            IpAddr::V6(ip) => format!("{}:{:04X}", encode_ipv6(ip), addr.port()),
        }
    }

    fn encode_ipv4(ip: Ipv4Addr) -> String {
        let octets = ip.octets();
        format!(
            "{:02X}{:02X}{:02X}{:02X}",
            octets[3], octets[2], octets[1], octets[0]
        )
    }

    fn encode_ipv6(ip: Ipv6Addr) -> String {
        // Four 32-bit groups, each byte-swapped within the group.
        let octets = ip.octets();
        let mut out = String::with_capacity(32);
        for group in octets.chunks(4) {
            for byte in group.iter().rev() {
                out.push_str(&format!("{:02X}", byte));
            }
        }
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(peer: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            peer_addr: peer.parse().unwrap(),
            local_addr: "127.0.0.1:50000".parse().unwrap(),
        }
    }

    #[test]
    fn test_allow_all_admits_loopback_only() {
        let policy = AllowAllRelayPolicy;
        assert!(policy.is_connection_allowed(&descriptor("127.0.0.1:40001")));
        assert!(policy.is_connection_allowed(&descriptor("[::1]:40001")));
        assert!(!policy.is_connection_allowed(&descriptor("10.0.0.5:40001")));
    }

    #[test]
    fn test_same_process_rejects_non_loopback() {
        let policy = SameProcessRelayPolicy;
        assert!(!policy.is_connection_allowed(&descriptor("192.168.1.4:40001")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_same_process_admits_own_socket() {
        // A real socket pair owned by this process.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();

        let policy = SameProcessRelayPolicy;
        assert!(policy.is_connection_allowed(&ConnectionDescriptor {
            peer_addr,
            local_addr: accepted.local_addr().unwrap(),
        }));
        drop(client);
    }
}
