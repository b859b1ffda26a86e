//! Semantic network-address comparison
//!
//! Deciding "did this inbound socket originate from the publisher host" must
//! not be defeated by representation: a publisher registered as `1.2.3.4` may
//! dial back through a dual-stack listener and show up as `::ffff:1.2.3.4`,
//! and UDP datagram sources on link-local IPv6 carry a `%iface` scope suffix.

use std::net::IpAddr;

/// Reduce IPv4-mapped IPv6 addresses to their IPv4 form
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Compare two addresses for semantic host equality
pub fn same_host(lhs: IpAddr, rhs: IpAddr) -> bool {
    canonical(lhs) == canonical(rhs)
}

/// Parse a host string into an address, stripping any IPv6 `%iface`
/// scope-id suffix first
pub fn parse_host(host: &str) -> Option<IpAddr> {
    let bare = match host.rfind('%') {
        Some(index) => &host[..index],
        None => host,
    };
    bare.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_equality() {
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.5".parse().unwrap();
        let c: IpAddr = "203.0.113.6".parse().unwrap();
        assert!(same_host(a, b));
        assert!(!same_host(a, c));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_matches_ipv4() {
        let mapped: IpAddr = "::ffff:203.0.113.5".parse().unwrap();
        let plain: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(same_host(mapped, plain));
        assert!(same_host(plain, mapped));
    }

    #[test]
    fn test_ipv6_not_equal_to_unrelated_ipv4() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(!same_host(v6, v4));
    }

    #[test]
    fn test_parse_host_strips_scope_id() {
        assert_eq!(
            parse_host("fe80::1%eth0"),
            Some("fe80::1".parse().unwrap())
        );
        assert_eq!(parse_host("203.0.113.5"), Some("203.0.113.5".parse().unwrap()));
        assert_eq!(parse_host("not-an-address"), None);
    }
}
