//! Peer address API: a cached, comparable representation of
//! "who's on the other end of this socket", independent of where it came
//! from (an `accept()`, a proxy header, or an imported snapshot).

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Unix(PathBuf),
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl PeerAddr {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => PeerAddr::V4(v4),
            SocketAddr::V6(v6) => PeerAddr::V6(v6),
        }
    }

    /// Host-order port for AF_INET/AF_INET6, `-1` otherwise.
    pub fn port(&self) -> i32 {
        match self {
            PeerAddr::V4(a) => a.port() as i32,
            PeerAddr::V6(a) => a.port() as i32,
            PeerAddr::Unix(_) => -1,
        }
    }

    /// Numeric host:port text. IPv4 is formatted directly as a dotted-quad
    /// without going through a generic formatter/resolver fast path; IPv6
    /// and unix paths fall back to the general (still purely numeric, no
    /// DNS) path, the same split `getnameinfo(NI_NUMERICHOST)` makes.
    pub fn numeric_host(&self) -> String {
        match self {
            PeerAddr::V4(a) => {
                let o = a.ip().octets();
                let mut s = String::with_capacity(15);
                let _ = write!(s, "{}.{}.{}.{}", o[0], o[1], o[2], o[3]);
                s
            }
            PeerAddr::V6(a) => a.ip().to_string(),
            PeerAddr::Unix(p) => p.display().to_string(),
        }
    }

    fn family_rank(&self) -> u8 {
        match self {
            PeerAddr::Unix(_) => 0,
            PeerAddr::V4(_) => 1,
            PeerAddr::V6(_) => 2,
        }
    }
}

/// Total order: family first, then family-specific fields.
/// Two addresses compare equal iff family and address fields are
/// byte-equal -- `flowinfo`/`scope_id` included for v6, consistent with
/// `PartialEq`.
impl PartialOrd for PeerAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PeerAddr::Unix(a), PeerAddr::Unix(b)) => a.cmp(b),
            (PeerAddr::V4(a), PeerAddr::V4(b)) => a.ip().cmp(b.ip()).then(a.port().cmp(&b.port())),
            (PeerAddr::V6(a), PeerAddr::V6(b)) => a
                .ip()
                .cmp(b.ip())
                .then(a.port().cmp(&b.port()))
                .then(a.flowinfo().cmp(&b.flowinfo()))
                .then(a.scope_id().cmp(&b.scope_id())),
            _ => self.family_rank().cmp(&other.family_rank()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn v4_fast_path_formats_dotted_quad() {
        let a = PeerAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert_eq!(a.numeric_host(), "127.0.0.1");
        assert_eq!(a.port(), 8080);
    }

    #[test]
    fn unix_has_no_port() {
        let a = PeerAddr::Unix(PathBuf::from("/tmp/sock"));
        assert_eq!(a.port(), -1);
    }

    #[test]
    fn total_order_is_reflexive_antisymmetric_transitive() {
        let a = PeerAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1));
        let b = PeerAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2));
        let c = PeerAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 1, 0, 0));

        assert_eq!(a.cmp(&a), Ordering::Equal);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_eq!(a.cmp(&c), Ordering::Less);
        assert_eq!(b.cmp(&c), Ordering::Less);
    }

    #[test]
    fn equality_matches_zero_comparison() {
        let a = PeerAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 7, 9));
        let b = PeerAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 7, 9));
        let c = PeerAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 7, 10));
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
        assert_ne!(a.cmp(&c), Ordering::Equal);
    }
}
