/// Egress interface enumeration.
///
/// Interfaces are queried once at startup (or pinned via the config file)
/// and the resulting ordered list is read-only for the rest of the run.
/// Adapters that come up later are picked up on the next daemon restart.

use std::net::Ipv4Addr;

use anyhow::Context;
use get_if_addrs::IfAddr;

/// One usable egress interface: a symbolic name and the IPv4 address that
/// outbound sockets bind to in order to route through it.
#[derive(Debug, Clone)]
pub struct Iface {
    pub name: String,
    pub ipv4: Ipv4Addr,
}

/// Ordered interface list. The order is the OS enumeration order (or the
/// config-file order when pinned) and doubles as the selector's tie-break
/// order.
#[derive(Debug, Clone, Default)]
pub struct Ifaces {
    list: Vec<Iface>,
}

impl Ifaces {
    pub fn new(list: Vec<Iface>) -> Self {
        Self { list }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Iface> {
        self.list.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(|i| i.name.as_str())
    }

    pub fn ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        self.list.iter().find(|i| i.name == name).map(|i| i.ipv4)
    }

    /// Reverse lookup: which interface holds this address?
    pub fn name_for_ip(&self, ip: Ipv4Addr) -> Option<&str> {
        self.list
            .iter()
            .find(|i| i.ipv4 == ip)
            .map(|i| i.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Query the OS for up, non-loopback interfaces holding an IPv4 address.
/// The first IPv4 address wins for interfaces carrying several.
pub fn enumerate() -> anyhow::Result<Ifaces> {
    let mut list: Vec<Iface> = Vec::new();
    for ifa in get_if_addrs::get_if_addrs().context("failed to enumerate network interfaces")? {
        if ifa.is_loopback() {
            continue;
        }
        let IfAddr::V4(ref v4) = ifa.addr else {
            continue;
        };
        if list.iter().any(|i| i.name == ifa.name) {
            continue;
        }
        list.push(Iface {
            name: ifa.name,
            ipv4: v4.ip,
        });
    }
    Ok(Ifaces::new(list))
}

/// Build the list from explicit `[[interfaces]]` config entries instead of
/// the OS query. Entry order is preserved.
pub fn from_entries(entries: &[(String, String)]) -> anyhow::Result<Ifaces> {
    let mut list = Vec::with_capacity(entries.len());
    for (name, addr) in entries {
        let ipv4: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("interface '{name}' has invalid IPv4 address '{addr}'"))?;
        list.push(Iface {
            name: name.clone(),
            ipv4,
        });
    }
    Ok(Ifaces::new(list))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_entries_preserves_order() {
        let ifaces = from_entries(&[
            ("wlan0".to_string(), "192.168.1.100".to_string()),
            ("eth0".to_string(), "192.168.1.101".to_string()),
        ])
        .unwrap();
        let names: Vec<&str> = ifaces.names().collect();
        assert_eq!(names, vec!["wlan0", "eth0"]);
        assert_eq!(ifaces.ipv4("eth0"), Some(Ipv4Addr::new(192, 168, 1, 101)));
    }

    #[test]
    fn from_entries_rejects_bad_address() {
        let err = from_entries(&[("eth0".to_string(), "not-an-ip".to_string())]);
        assert!(err.is_err());
    }

    #[test]
    fn name_for_ip_reverse_lookup() {
        let ifaces = from_entries(&[("eth0".to_string(), "10.0.0.2".to_string())]).unwrap();
        assert_eq!(ifaces.name_for_ip(Ipv4Addr::new(10, 0, 0, 2)), Some("eth0"));
        assert_eq!(ifaces.name_for_ip(Ipv4Addr::new(10, 0, 0, 3)), None);
    }

    #[test]
    fn unknown_name_has_no_address() {
        let ifaces = Ifaces::default();
        assert!(ifaces.is_empty());
        assert_eq!(ifaces.ipv4("eth0"), None);
    }
}
