//! Process hostname lookup and local interface enumeration.
//!
//! Both are out-of-core collaborators per the design: the [`crate::service`]
//! builder and [`crate::Mdns`] handle program against the traits, not the
//! concrete OS calls, so tests can substitute fixed values.

use std::net::IpAddr;

use anyhow::{Context, Result};

/// One address on a local network interface, as returned by `localInterfaces()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub mac: Option<[u8; 6]>,
    pub internal: bool,
}

const ZERO_MAC: [u8; 6] = [0, 0, 0, 0, 0, 0];

impl InterfaceAddress {
    /// Whether this address is eligible for inclusion in a service's A/AAAA
    /// records, per the filter rule: skip internal, skip zero MAC.
    pub fn is_eligible(&self) -> bool {
        if self.internal {
            return false;
        }
        !matches!(self.mac, Some(ZERO_MAC))
    }
}

pub trait HostResolver: Send + Sync {
    fn hostname(&self) -> Result<String>;
}

pub trait InterfaceLister: Send + Sync {
    fn local_interfaces(&self) -> Result<Vec<InterfaceAddress>>;
}

/// Resolves the hostname via the OS (`hostname` crate).
pub struct SystemHostResolver;

impl HostResolver for SystemHostResolver {
    fn hostname(&self) -> Result<String> {
        let name = hostname::get().context("reading process hostname")?;
        name.into_string()
            .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))
    }
}

/// Enumerates local interfaces via `if_addrs`, the same crate the teacher
/// uses for its own mDNS interface loop.
pub struct IfAddrsInterfaceLister;

impl InterfaceLister for IfAddrsInterfaceLister {
    fn local_interfaces(&self) -> Result<Vec<InterfaceAddress>> {
        let ifaces = if_addrs::get_if_addrs().context("enumerating local interfaces")?;
        // if_addrs does not surface a MAC address on this platform set; the
        // zero-MAC skip rule is still enforced in `is_eligible` for
        // listers that can provide one (tests use a fixture lister to
        // exercise it).
        Ok(ifaces
            .into_iter()
            .map(|iface| InterfaceAddress {
                address: iface.ip(),
                mac: None,
                internal: iface.is_loopback(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_internal_and_zero_mac() {
        let loopback = InterfaceAddress {
            address: "127.0.0.1".parse().unwrap(),
            mac: None,
            internal: true,
        };
        assert!(!loopback.is_eligible());

        let zero_mac = InterfaceAddress {
            address: "192.168.1.5".parse().unwrap(),
            mac: Some(ZERO_MAC),
            internal: false,
        };
        assert!(!zero_mac.is_eligible());

        let eligible = InterfaceAddress {
            address: "192.168.1.5".parse().unwrap(),
            mac: Some([1, 2, 3, 4, 5, 6]),
            internal: false,
        };
        assert!(eligible.is_eligible());
    }
}
