// src/core/auth/ip.rs

//! Address predicates for HBA matching: CIDR ranges, same-host, same-net and
//! hostname rules, with IPv4 addresses lifted into the IPv6 mapped range
//! when compared against IPv6 networks.

use crate::core::errors::PoolError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use sysinfo::Networks;
use tracing::warn;

/// The address part of one HBA rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressMatch {
    All,
    SameHost,
    SameNet,
    Cidr { net: IpAddr, mask: IpAddr },
    Hostname(String),
}

/// Converts an address to its 16-byte form, lifting IPv4 via `::ffff:a.b.c.d`.
fn to_v6_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// True iff every bit of `(addr XOR net) AND mask` is zero, families checked
/// first. An IPv4 address tested against an IPv6 net/mask is lifted; an IPv6
/// address never matches an IPv4 net.
pub fn range_sock_addr(addr: IpAddr, net: IpAddr, mask: IpAddr) -> bool {
    match (addr, net, mask) {
        (IpAddr::V4(a), IpAddr::V4(n), IpAddr::V4(m)) => {
            let (a, n, m) = (a.octets(), n.octets(), m.octets());
            a.iter().zip(n).zip(m).all(|((&a, n), m)| (a ^ n) & m == 0)
        }
        (addr, IpAddr::V6(n), IpAddr::V6(m)) => {
            let a = to_v6_bytes(addr);
            let (n, m) = (n.octets(), m.octets());
            a.iter().zip(n).zip(m).all(|((&a, n), m)| (a ^ n) & m == 0)
        }
        _ => false,
    }
}

/// Builds a netmask address from a prefix length in the given family.
pub fn mask_from_prefix(prefix: u8, v6: bool) -> Result<IpAddr, PoolError> {
    if v6 {
        if prefix > 128 {
            return Err(PoolError::Config(format!("invalid IPv6 prefix /{prefix}")));
        }
        let mut octets = [0u8; 16];
        fill_mask(&mut octets, prefix);
        Ok(IpAddr::V6(Ipv6Addr::from(octets)))
    } else {
        if prefix > 32 {
            return Err(PoolError::Config(format!("invalid IPv4 prefix /{prefix}")));
        }
        let mut octets = [0u8; 4];
        fill_mask(&mut octets, prefix);
        Ok(IpAddr::V4(Ipv4Addr::from(octets)))
    }
}

fn fill_mask(octets: &mut [u8], prefix: u8) {
    let mut remaining = prefix as usize;
    for octet in octets.iter_mut() {
        let take = remaining.min(8);
        *octet = if take == 0 {
            0
        } else {
            (!0u8) << (8 - take)
        };
        remaining -= take;
    }
}

/// Addresses assigned to local interfaces, for same-host/same-net rules.
fn local_networks() -> Vec<(IpAddr, u8)> {
    let networks = Networks::new_with_refreshed_list();
    let mut out = Vec::new();
    for (_name, data) in networks.iter() {
        for ip_net in data.ip_networks() {
            out.push((ip_net.addr, ip_net.prefix));
        }
    }
    out
}

/// True when the client address equals any local interface address.
pub fn matches_same_host(client: IpAddr) -> bool {
    if client.is_loopback() {
        return true;
    }
    local_networks().iter().any(|&(addr, _)| addr == client)
}

/// True when the client, masked by an interface's netmask, equals that
/// interface's network.
pub fn matches_same_net(client: IpAddr) -> bool {
    local_networks().iter().any(|&(addr, prefix)| {
        let v6 = addr.is_ipv6();
        match mask_from_prefix(prefix, v6) {
            Ok(mask) => range_sock_addr(client, addr, mask),
            Err(_) => false,
        }
    })
}

/// Hostname rules: a leading dot makes it a suffix pattern, otherwise the
/// name is resolved forward and any of its addresses must equal the client.
/// Suffix patterns need a reverse lookup the runtime does not provide, so
/// they never match and draw a warning.
pub async fn matches_hostname(pattern: &str, client: IpAddr) -> bool {
    if pattern.starts_with('.') {
        warn!(
            "hostname suffix pattern \"{}\" cannot be verified without reverse DNS; treating as no match",
            pattern
        );
        return false;
    }
    let Ok(addrs) = tokio::net::lookup_host((pattern, 0u16)).await else {
        return false;
    };
    addrs.map(|sa| sa.ip()).any(|ip| ip == client)
}

impl AddressMatch {
    /// Evaluates the predicate for a network client.
    pub async fn matches(&self, client: IpAddr) -> bool {
        match self {
            AddressMatch::All => true,
            AddressMatch::SameHost => matches_same_host(client),
            AddressMatch::SameNet => matches_same_net(client),
            AddressMatch::Cidr { net, mask } => range_sock_addr(client, *net, *mask),
            AddressMatch::Hostname(pattern) => matches_hostname(pattern, client).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_cidr_matching() {
        let net = ip("192.168.1.0");
        let mask = mask_from_prefix(24, false).unwrap();
        assert!(range_sock_addr(ip("192.168.1.42"), net, mask));
        assert!(!range_sock_addr(ip("192.168.2.42"), net, mask));
    }

    #[test]
    fn v4_client_lifts_into_v6_net() {
        let net = ip("::ffff:10.0.0.0");
        let mask = mask_from_prefix(104, true).unwrap();
        assert!(range_sock_addr(ip("10.1.2.3"), net, mask));
        assert!(!range_sock_addr(ip("11.1.2.3"), net, mask));
    }

    #[test]
    fn v6_client_never_matches_v4_net() {
        let net = ip("10.0.0.0");
        let mask = mask_from_prefix(8, false).unwrap();
        assert!(!range_sock_addr(ip("::1"), net, mask));
    }

    #[test]
    fn mask_construction() {
        assert_eq!(mask_from_prefix(0, false).unwrap(), ip("0.0.0.0"));
        assert_eq!(mask_from_prefix(32, false).unwrap(), ip("255.255.255.255"));
        assert_eq!(mask_from_prefix(25, false).unwrap(), ip("255.255.255.128"));
        assert!(mask_from_prefix(33, false).is_err());
        assert!(mask_from_prefix(129, true).is_err());
    }
}
