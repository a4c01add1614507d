//! Free port allocation for launching debug server processes.
//!
//! An allocation walks the caller's preferred ports in order and finishes with
//! port `0`, which lets the OS pick any free ephemeral port. A preferred port
//! is accepted only if it binds on every local host (or on the pinned host) and
//! is not currently leased. The OS-assigned fallback is re-probed until it
//! yields a port that is not leased.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::hosts::{BindHost, local_hosts};
use crate::lease::{LeaseRegistry, spawn_aging_task};
use crate::probe::probe;

/// Upper bound on re-probing port `0` when the OS keeps returning leased ports.
const MAX_EPHEMERAL_REPROBES: u32 = 4096;

/// One allocation call: preferred ports, exclusions, and an optional host.
///
/// With no preferred ports the allocator goes straight to an OS-assigned port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    pub preferred_ports: Vec<u16>,
    pub exclude: HashSet<u16>,
    pub host: Option<String>,
}

impl AllocationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single preferred port.
    pub fn port(mut self, port: u16) -> Self {
        self.preferred_ports.push(port);
        self
    }

    /// Append preferred ports, e.g. from `port_numbers`.
    pub fn ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.preferred_ports.extend(ports);
        self
    }

    /// Never return any of these ports.
    pub fn exclude(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.exclude.extend(ports);
        self
    }

    /// Only probe this host instead of every local address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// The candidate sequence: preferred ports, then the `0` fallback.
    pub fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        self.preferred_ports
            .iter()
            .copied()
            .chain(std::iter::once(0))
    }
}

/// Allocates free local ports, leasing each one in a shared `LeaseRegistry`.
pub struct PortAllocator {
    leases: Arc<LeaseRegistry>,
    aging_interval: Option<Duration>,
    aging_task: OnceLock<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl PortAllocator {
    /// Allocator over `leases`. The caller is responsible for calling
    /// `LeaseRegistry::tick()` on its own schedule.
    pub fn new(leases: Arc<LeaseRegistry>) -> Self {
        Self {
            leases,
            aging_interval: None,
            aging_task: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Allocator with a fresh registry that ages itself every `interval`.
    ///
    /// The aging task is spawned on the first `allocate` call and stops on
    /// `shutdown()` or when the allocator is dropped.
    pub fn with_aging(interval: Duration) -> Self {
        Self {
            leases: Arc::new(LeaseRegistry::new()),
            aging_interval: Some(interval),
            aging_task: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The lease registry backing this allocator.
    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    /// Find a free port for `request` and lease it.
    pub async fn allocate(&self, request: &AllocationRequest) -> crate::Result<u16> {
        self.ensure_aging();

        let fixed_host = match request.host.as_deref() {
            Some(host) => Some(resolve_host(host).await?),
            None => None,
        };
        let hosts = if fixed_host.is_none() && !request.preferred_ports.is_empty() {
            local_hosts()
        } else {
            Vec::new()
        };

        let hosts = hosts.as_slice();
        first_available(request.candidates(), &request.exclude, move |candidate| {
            self.lease_candidate(candidate, fixed_host, hosts)
        })
        .await
    }

    /// Stop the aging task, if one was started.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn ensure_aging(&self) {
        if let Some(interval) = self.aging_interval {
            self.aging_task.get_or_init(|| {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "starting lease aging");
                spawn_aging_task(self.leases.clone(), interval, self.cancel.child_token())
            });
        }
    }

    async fn lease_candidate(
        &self,
        candidate: u16,
        fixed_host: Option<BindHost>,
        hosts: &[BindHost],
    ) -> crate::Result<u16> {
        let mut reprobes = 0;
        loop {
            let port = probe_candidate(candidate, fixed_host, hosts).await?;
            if self.leases.try_lease(port) {
                return Ok(port);
            }
            // A pinned port is never retried; only the OS fallback rotates.
            if candidate != 0 || reprobes >= MAX_EPHEMERAL_REPROBES {
                return Err(BridgeError::LockConflict(port));
            }
            reprobes += 1;
            tracing::trace!(port, "OS reissued a leased port, probing again");
        }
    }
}

impl Drop for PortAllocator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Try each non-excluded candidate in order. Recoverable failures move on to
/// the next candidate; anything else ends the allocation.
async fn first_available<F, Fut>(
    candidates: impl Iterator<Item = u16>,
    exclude: &HashSet<u16>,
    mut attempt: F,
) -> crate::Result<u16>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = crate::Result<u16>>,
{
    for candidate in candidates {
        if exclude.contains(&candidate) {
            tracing::trace!(port = candidate, "skipping excluded port");
            continue;
        }

        match attempt(candidate).await {
            Ok(port) => {
                tracing::debug!(port, requested = candidate, "allocated port");
                return Ok(port);
            }
            Err(e) if e.is_recoverable() => {
                tracing::debug!(port = candidate, error = %e, "candidate port unavailable");
            }
            Err(e) => return Err(e),
        }
    }

    Err(BridgeError::NoPortsAvailable)
}

async fn probe_candidate(
    candidate: u16,
    fixed_host: Option<BindHost>,
    hosts: &[BindHost],
) -> crate::Result<u16> {
    match fixed_host {
        Some(host) => probe(host, candidate).await,
        None if candidate == 0 => probe(BindHost::Default, 0).await,
        None => probe_all_hosts(candidate, hosts).await,
    }
}

/// Probe `port` on every host; the port is free only if no specific host
/// reports it in use and at least one host actually bound it.
async fn probe_all_hosts(port: u16, hosts: &[BindHost]) -> crate::Result<u16> {
    let mut bound_any = false;
    let mut last_skipped = None;

    for &host in hosts {
        match probe(host, port).await {
            Ok(_) => bound_any = true,
            Err(e @ (BridgeError::AddressNotAvailable(..) | BridgeError::InvalidAddress(..))) => {
                tracing::trace!(%host, port, error = %e, "host not eligible");
                last_skipped = Some(e);
            }
            Err(e @ BridgeError::AddressInUse(..)) if host.is_wildcard() => {
                tracing::trace!(%host, port, "wildcard in use, checking remaining hosts");
                last_skipped = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    if bound_any {
        Ok(port)
    } else {
        Err(last_skipped
            .unwrap_or_else(|| BridgeError::AddressNotAvailable("any".to_string(), port)))
    }
}

/// Resolve a caller-supplied host to one bind address.
async fn resolve_host(host: &str) -> crate::Result<BindHost> {
    let host = host.trim();
    if host.is_empty() {
        return Err(BridgeError::Validation("host must not be empty".to_string()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(BindHost::Ip(ip));
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| BridgeError::Validation(format!("cannot resolve host '{}': {}", host, e)))?;
    addrs
        .next()
        .map(|addr| BindHost::Ip(addr.ip()))
        .ok_or_else(|| BridgeError::Validation(format!("host '{}' has no addresses", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::port_numbers;

    fn allocator() -> PortAllocator {
        PortAllocator::new(Arc::new(LeaseRegistry::new()))
    }

    /// A port the OS considers free right now.
    async fn free_port() -> u16 {
        probe(BindHost::Default, 0).await.unwrap()
    }

    #[test]
    fn test_candidates_end_with_zero() {
        let request = AllocationRequest::new().port(5000).port(5001);
        assert_eq!(request.candidates().collect::<Vec<_>>(), vec![5000, 5001, 0]);

        let empty = AllocationRequest::new();
        assert_eq!(empty.candidates().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_candidates_restart_per_call() {
        let request = AllocationRequest::new().ports(port_numbers(6000, 6001).unwrap());
        let first: Vec<u16> = request.candidates().collect();
        let second: Vec<u16> = request.candidates().collect();
        assert_eq!(first, vec![6000, 6001, 0]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_allocate_any_port() {
        let allocator = allocator();
        let port = allocator.allocate(&AllocationRequest::new()).await.unwrap();
        assert_ne!(port, 0);
        assert!(allocator.leases().is_leased(port));
    }

    #[tokio::test]
    async fn test_allocate_preferred_port() {
        let allocator = allocator();
        let preferred = free_port().await;
        let port = allocator
            .allocate(&AllocationRequest::new().port(preferred))
            .await
            .unwrap();
        assert_eq!(port, preferred);
    }

    #[tokio::test]
    async fn test_allocate_with_pinned_host() {
        let allocator = allocator();
        let port = allocator
            .allocate(&AllocationRequest::new().host("127.0.0.1"))
            .await
            .unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_excluded_preferred_port_is_never_returned() {
        let allocator = allocator();
        let request = AllocationRequest::new().port(5000).exclude([5000]);
        for _ in 0..5 {
            let port = allocator.allocate(&request).await.unwrap();
            assert_ne!(port, 5000);
            assert_ne!(port, 0);
        }
    }

    #[tokio::test]
    async fn test_in_use_preferred_port_falls_back() {
        let allocator = allocator();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();

        let port = allocator
            .allocate(&AllocationRequest::new().port(busy))
            .await
            .unwrap();
        assert_ne!(port, busy);
        drop(held);
    }

    #[tokio::test]
    async fn test_leased_preferred_port_is_skipped() {
        let allocator = allocator();
        let preferred = free_port().await;
        let request = AllocationRequest::new().port(preferred);

        let first = allocator.allocate(&request).await.unwrap();
        let second = allocator.allocate(&request).await.unwrap();
        assert_eq!(first, preferred);
        assert_ne!(second, preferred, "leased port must not be handed out twice");
    }

    #[tokio::test]
    async fn test_lease_expires_after_two_ticks() {
        let allocator = allocator();
        let preferred = free_port().await;
        let request = AllocationRequest::new().port(preferred);

        assert_eq!(allocator.allocate(&request).await.unwrap(), preferred);
        allocator.leases().tick();
        assert_ne!(allocator.allocate(&request).await.unwrap(), preferred);
        allocator.leases().tick();
        allocator.leases().tick();
        assert_eq!(allocator.allocate(&request).await.unwrap(), preferred);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let allocator = Arc::new(allocator());
        let tasks = (0..32).map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate(&AllocationRequest::new()).await })
        });

        let ports: Vec<u16> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len(), "duplicate port in {:?}", ports);
    }

    #[tokio::test]
    async fn test_every_candidate_excluded() {
        let allocator = allocator();
        let request = AllocationRequest::new().exclude([0]);
        let result = allocator.allocate(&request).await;
        assert!(matches!(result, Err(BridgeError::NoPortsAvailable)));
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let allocator = allocator();
        let result = allocator.allocate(&AllocationRequest::new().host("  ")).await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[tokio::test]
    async fn test_probe_all_hosts_reports_specific_in_use() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();
        let hosts = [BindHost::Ip("127.0.0.1".parse().unwrap())];

        let result = probe_all_hosts(busy, &hosts).await;
        assert!(matches!(result, Err(BridgeError::AddressInUse(_, p)) if p == busy));
    }

    #[tokio::test]
    async fn test_probe_all_hosts_skips_foreign_addresses() {
        let port = free_port().await;
        let hosts = [
            BindHost::Ip("192.0.2.1".parse().unwrap()),
            BindHost::Ip("127.0.0.1".parse().unwrap()),
        ];
        assert_eq!(probe_all_hosts(port, &hosts).await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_probe_all_hosts_wildcard_in_use_everywhere() {
        let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = held.local_addr().unwrap().port();
        let hosts = [BindHost::Ip("0.0.0.0".parse().unwrap())];

        let result = probe_all_hosts(busy, &hosts).await;
        assert!(matches!(result, Err(BridgeError::AddressInUse(_, p)) if p == busy));
    }

    #[tokio::test]
    async fn test_probe_all_hosts_continues_past_wildcard_in_use() {
        // IPv6 loopback does not conflict with an IPv4 wildcard listener.
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return;
        }
        let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = held.local_addr().unwrap().port();
        let hosts = [
            BindHost::Ip("0.0.0.0".parse().unwrap()),
            BindHost::Ip("::1".parse().unwrap()),
        ];

        assert_eq!(probe_all_hosts(busy, &hosts).await.unwrap(), busy);
    }

    #[tokio::test]
    async fn test_wildcard_in_use_preferred_port_falls_back() {
        let allocator = allocator();
        let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = held.local_addr().unwrap().port();

        let port = allocator
            .allocate(&AllocationRequest::new().port(busy))
            .await
            .unwrap();
        assert_ne!(port, busy);
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_allocation() {
        let mut tried = Vec::new();
        let result = first_available([80, 5000, 0].into_iter(), &HashSet::new(), |candidate| {
            tried.push(candidate);
            async move {
                Err(BridgeError::Io {
                    host: "0.0.0.0".to_string(),
                    port: candidate,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(BridgeError::Io { port: 80, .. })));
        assert_eq!(tried, vec![80]);
    }

    #[tokio::test]
    async fn test_recoverable_error_tries_next_candidate() {
        let mut tried = Vec::new();
        let exclude: HashSet<u16> = [5001].into_iter().collect();
        let result = first_available([5000, 5001, 5002, 0].into_iter(), &exclude, |candidate| {
            tried.push(candidate);
            async move {
                if candidate == 5000 {
                    Err(BridgeError::AddressInUse("0.0.0.0".to_string(), candidate))
                } else {
                    Ok(candidate)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 5002);
        assert_eq!(tried, vec![5000, 5002]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_starts_on_first_allocation() {
        let allocator = PortAllocator::with_aging(Duration::from_secs(15));
        let preferred = free_port().await;
        let request = AllocationRequest::new().port(preferred);

        assert_eq!(allocator.allocate(&request).await.unwrap(), preferred);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!allocator.leases().is_leased(preferred));
        assert_eq!(allocator.allocate(&request).await.unwrap(), preferred);
        allocator.shutdown();
    }
}
