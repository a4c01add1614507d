//! Port availability probe.
//!
//! Binds a listening socket to `(host, port)` and drops it straight away. A
//! successful probe only says the port was free at that instant; the lease
//! registry is what keeps two callers from being handed the same port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::TcpListener;

use crate::error::BridgeError;
use crate::hosts::BindHost;

/// Probe `port` on `host`, returning the port the OS actually bound.
///
/// For `port == 0` the returned value is the OS-assigned ephemeral port.
pub async fn probe(host: BindHost, port: u16) -> crate::Result<u16> {
    let bound = match host {
        BindHost::Ip(ip) => bind_and_release(SocketAddr::new(ip, port)).await,
        BindHost::Default => {
            let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
            match bind_and_release(v6).await {
                Ok(bound) => Ok(bound),
                Err(e) if falls_back_to_ipv4(&e) => {
                    tracing::debug!(port, error = %e, "IPv6 wildcard unusable, probing 0.0.0.0");
                    let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                    bind_and_release(v4).await
                }
                Err(e) => Err(e),
            }
        }
    };

    bound.map_err(|e| classify(host, port, e))
}

async fn bind_and_release(addr: SocketAddr) -> io::Result<u16> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn falls_back_to_ipv4(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// Map an OS bind error onto the allocator's error taxonomy.
pub(crate) fn classify(host: BindHost, port: u16, e: io::Error) -> BridgeError {
    let host = host.to_string();
    match e.kind() {
        io::ErrorKind::AddrInUse => BridgeError::AddressInUse(host, port),
        io::ErrorKind::AddrNotAvailable => BridgeError::AddressNotAvailable(host, port),
        io::ErrorKind::InvalidInput => BridgeError::InvalidAddress(host, port),
        _ => BridgeError::Io {
            host,
            port,
            source: e,
        },
    }
}
