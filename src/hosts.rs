//! Local bind address enumeration.
//!
//! The allocator probes a candidate port on every address a child process
//! could end up listening on: the default listener address, the IPv4 wildcard,
//! and each address currently assigned to a network interface.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// A host the allocator can probe a port on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindHost {
    /// Whatever a listener without an explicit host binds: the dual-stack
    /// IPv6 wildcard, or the IPv4 wildcard when IPv6 is unusable.
    Default,
    /// A concrete address, treated as an opaque bind target.
    Ip(IpAddr),
}

impl BindHost {
    /// Wildcard hosts overlap with every other host, so an in-use result on
    /// one of them says nothing definite about a specific interface.
    pub fn is_wildcard(&self) -> bool {
        match self {
            BindHost::Default => true,
            BindHost::Ip(ip) => ip.is_unspecified(),
        }
    }
}

impl fmt::Display for BindHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindHost::Default => f.write_str("default"),
            BindHost::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<IpAddr> for BindHost {
    fn from(ip: IpAddr) -> Self {
        BindHost::Ip(ip)
    }
}

/// List the hosts to probe when the caller did not pin one.
///
/// Always starts with `Default` and `0.0.0.0`, followed by interface
/// addresses in enumeration order, without duplicates. Interface enumeration
/// failures are logged and leave just the two wildcard entries.
pub fn local_hosts() -> Vec<BindHost> {
    let mut hosts = vec![
        BindHost::Default,
        BindHost::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    ];

    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                push_unique(&mut hosts, BindHost::Ip(iface.ip()));
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate network interfaces");
        }
    }

    hosts
}

fn push_unique(hosts: &mut Vec<BindHost>, host: BindHost) {
    if !hosts.contains(&host) {
        hosts.push(host);
    }
}
