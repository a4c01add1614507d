//! Two-generation lease registry for recently allocated ports.
//!
//! The kernel happily reports a port as free between the moment the allocator
//! probes it and the moment the child process binds it. Leases close that
//! window inside this process: a leased port is never handed out again until
//! it has aged through two ticks.
//!
//! On every tick the old generation is discarded, the young generation becomes
//! old, and a fresh young generation starts. A lease therefore survives between
//! one and two tick intervals without needing a timer per lease.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default aging interval between ticks.
pub const DEFAULT_LEASE_INTERVAL: Duration = Duration::from_secs(15);

/// A record that `port` was handed out at `leased_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub leased_at: Instant,
}

#[derive(Debug, Default)]
struct Generations {
    young: HashMap<u16, Instant>,
    old: HashMap<u16, Instant>,
}

impl Generations {
    fn contains(&self, port: u16) -> bool {
        self.young.contains_key(&port) || self.old.contains_key(&port)
    }
}

/// Shared record of recently leased ports.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    generations: Mutex<Generations>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Generations> {
        self.generations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `port` is in either generation.
    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().contains(port)
    }

    /// Lease `port` unless it is already leased.
    ///
    /// Check and insert happen under one lock, so two concurrent callers can
    /// never both lease the same port. Returns `false` on conflict.
    pub fn try_lease(&self, port: u16) -> bool {
        let mut generations = self.lock();
        if generations.contains(port) {
            return false;
        }
        generations.young.insert(port, Instant::now());
        true
    }

    /// Age the registry by one generation.
    pub fn tick(&self) {
        let mut generations = self.lock();
        let young = std::mem::take(&mut generations.young);
        let expired = std::mem::replace(&mut generations.old, young);
        if !expired.is_empty() {
            tracing::debug!(released = expired.len(), "released aged port leases");
        }
    }

    /// Snapshot of all live leases, oldest first.
    pub fn leases(&self) -> Vec<PortLease> {
        let generations = self.lock();
        let mut leases: Vec<PortLease> = generations
            .old
            .iter()
            .chain(generations.young.iter())
            .map(|(&port, &leased_at)| PortLease { port, leased_at })
            .collect();
        leases.sort_by_key(|lease| (lease.leased_at, lease.port));
        leases
    }

    /// Number of live leases across both generations.
    pub fn len(&self) -> usize {
        let generations = self.lock();
        generations.young.len() + generations.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `registry.tick()` every `interval` until `cancel` fires.
///
/// The task only holds an `Arc` to the registry; the runtime does not wait
/// for it at shutdown.
pub fn spawn_aging_task(
    registry: Arc<LeaseRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.tick(),
                _ = cancel.cancelled() => {
                    tracing::debug!("lease aging task stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_lease_conflict() {
        let registry = LeaseRegistry::new();
        assert!(registry.try_lease(5000));
        assert!(!registry.try_lease(5000));
        assert!(registry.is_leased(5000));
        assert!(!registry.is_leased(5001));
    }

    #[test]
    fn test_lease_survives_one_tick() {
        let registry = LeaseRegistry::new();
        registry.try_lease(5000);
        registry.tick();
        assert!(registry.is_leased(5000), "lease should move to old generation");
        assert!(!registry.try_lease(5000));
    }

    #[test]
    fn test_lease_released_after_two_ticks() {
        let registry = LeaseRegistry::new();
        registry.try_lease(5000);
        registry.tick();
        registry.tick();
        assert!(!registry.is_leased(5000));
        assert!(registry.is_empty());
        assert!(registry.try_lease(5000));
    }

    #[test]
    fn test_generations_age_independently() {
        let registry = LeaseRegistry::new();
        registry.try_lease(5000);
        registry.tick();
        registry.try_lease(5001);
        registry.tick();
        // 5000 aged out, 5001 is now old
        assert!(!registry.is_leased(5000));
        assert!(registry.is_leased(5001));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_leases_snapshot() {
        let registry = LeaseRegistry::new();
        registry.try_lease(6000);
        registry.tick();
        registry.try_lease(6001);
        let ports: Vec<u16> = registry.leases().iter().map(|l| l.port).collect();
        assert_eq!(ports, vec![6000, 6001]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_task_ticks_on_interval() {
        let registry = Arc::new(LeaseRegistry::new());
        let cancel = CancellationToken::new();
        let handle = spawn_aging_task(registry.clone(), Duration::from_secs(15), cancel.clone());

        registry.try_lease(7000);
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(registry.is_leased(7000), "one tick keeps the lease");
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!registry.is_leased(7000), "two ticks release the lease");

        cancel.cancel();
        handle.await.unwrap();
    }
}
